// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::ngsocket::BaseConnectionType;
use serde::Serialize;
use std::net::SocketAddr;

/// Snapshot of the engine, suitable for logging as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
	pub device: String,
	pub source_port: u16,
	pub base_connection: BaseConnectionType,
	pub base_address: Option<SocketAddr>,
	/// Milliseconds since the base last confirmed UDP reachability.
	pub base_udp_age_ms: Option<u64>,
	pub local_addresses: Vec<SocketAddr>,
	pub peers: usize,
	pub queued_packets: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
	pub device: String,
	pub active: bool,
	pub connected: bool,
	pub negotiated: bool,
	pub reestablishing: bool,
	pub target_address: Option<SocketAddr>,
	pub link_local_address: Option<SocketAddr>,
	pub target_addresses: Vec<SocketAddr>,
	pub source_addresses: Vec<SocketAddr>,
	pub failed_establishments: u32,
	pub latency_ms: Option<u64>,
}
