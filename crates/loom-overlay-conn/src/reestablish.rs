// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_overlay_common::is_overlay_ip;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const PERIODIC_INTERVAL: Duration = Duration::from_secs(1);

pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(25);

pub const NAT_INIT_TIMEOUT: Duration = Duration::from_secs(3);

pub const TCP_PONG_TIMEOUT: Duration = Duration::from_secs(35);

pub const UDP_BASE_TIMEOUT: Duration = Duration::from_secs(35);

pub const REESTABLISH_TIMEOUT: Duration = Duration::from_secs(3);

/// A peer is active while data was sent to it within this window.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(120);

pub const MAX_FAILED_ESTABLISHMENTS: u32 = 5;

/// Time since `then`, or `Duration::MAX` when it never happened.
pub fn since(now: Instant, then: Option<Instant>) -> Duration {
	then.map(|t| now.saturating_duration_since(t))
		.unwrap_or(Duration::MAX)
}

pub fn may_retry(failed_establishments: u32) -> bool {
	failed_establishments <= MAX_FAILED_ESTABLISHMENTS
}

/// Whether sending to an unconnected peer should start a new probe burst.
pub fn should_reestablish_on_send(
	reestablishing: bool,
	last_reestablish: Option<Instant>,
	failed_establishments: u32,
	now: Instant,
) -> bool {
	!reestablishing
		|| (since(now, last_reestablish) > REESTABLISH_TIMEOUT && may_retry(failed_establishments))
}

/// A confirmed path is abandoned once a probe has gone unanswered too long.
pub fn should_fall_back_to_relay(
	connected: bool,
	reestablishing: bool,
	last_reestablish: Option<Instant>,
	now: Instant,
) -> bool {
	connected && reestablishing && since(now, last_reestablish) > REESTABLISH_TIMEOUT
}

/// Base TCP reconnect deadline. Tighter while no connection exists.
pub fn base_reconnect_timeout(has_connection: bool) -> Duration {
	if has_connection {
		TCP_PONG_TIMEOUT
	} else {
		NAT_INIT_TIMEOUT
	}
}

/// Sorted, deduplicated probe targets with overlay addresses and anything
/// `allowed` rejects removed.
pub fn candidate_addresses<'a>(
	targets: impl IntoIterator<Item = &'a SocketAddr>,
	link_local: Option<SocketAddr>,
	sources: impl IntoIterator<Item = &'a SocketAddr>,
	allowed: impl Fn(&SocketAddr) -> bool,
) -> Vec<SocketAddr> {
	let mut addresses: Vec<SocketAddr> = targets
		.into_iter()
		.copied()
		.chain(link_local)
		.chain(sources.into_iter().copied())
		.collect();
	addresses.sort();
	addresses.dedup();
	addresses.retain(|a| !is_overlay_ip(a.ip()) && allowed(a));
	addresses
}
