// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

pub const OVERLAY_NETWORK: &str = "fc94::/16";

const OVERLAY_BASE: u128 = 0xfc94_0000_0000_0000_0000_0000_0000_0000;
const OVERLAY_MASK: u128 = 0xffff_0000_0000_0000_0000_0000_0000_0000;
const LINK_LOCAL_V6_BASE: u128 = 0xfe80_0000_0000_0000_0000_0000_0000_0000;
const LINK_LOCAL_V6_MASK: u128 = 0xffc0_0000_0000_0000_0000_0000_0000_0000;

/// Collapses v4-mapped IPv6 addresses to plain IPv4.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
	match ip {
		IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
			Some(v4) => IpAddr::V4(v4),
			None => IpAddr::V6(v6),
		},
		v4 => v4,
	}
}

pub fn canonical_addr(addr: SocketAddr) -> SocketAddr {
	SocketAddr::new(canonical_ip(addr.ip()), addr.port())
}

/// Wire form of an IP: IPv4 travels as v4-mapped IPv6.
pub fn to_ipv6(ip: IpAddr) -> Ipv6Addr {
	match ip {
		IpAddr::V4(v4) => v4.to_ipv6_mapped(),
		IpAddr::V6(v6) => v6,
	}
}

pub fn is_overlay_ip(ip: IpAddr) -> bool {
	match canonical_ip(ip) {
		IpAddr::V6(v6) => (u128::from(v6) & OVERLAY_MASK) == OVERLAY_BASE,
		IpAddr::V4(_) => false,
	}
}

pub fn is_link_local(ip: IpAddr) -> bool {
	match canonical_ip(ip) {
		IpAddr::V6(v6) => (u128::from(v6) & LINK_LOCAL_V6_MASK) == LINK_LOCAL_V6_BASE,
		IpAddr::V4(v4) => v4.is_link_local(),
	}
}

/// Loopback and RFC 1918 ranges.
pub fn is_private_v4(ip: IpAddr) -> bool {
	match canonical_ip(ip) {
		IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
		IpAddr::V6(_) => false,
	}
}

/// Sources from which a multicast beacon is believable.
pub fn is_local_network(ip: IpAddr) -> bool {
	is_link_local(ip) || is_private_v4(ip)
}
