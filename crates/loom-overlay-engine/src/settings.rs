// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::SocketAddr;

pub const BASE_SERVER_PORT: u16 = 443;

/// Transport settings consumed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
	/// Hostnames tried in turn, each on [`BASE_SERVER_PORT`].
	pub base_servers: Vec<String>,
	/// `host:port` used instead of `base_servers` when set.
	pub override_base_address: Option<String>,
	pub enable_udp_tunneling: bool,
	pub enable_tcp_tunneling: bool,
	pub enable_udp: bool,
	pub enable_multicast: bool,
	pub override_source_port: Option<u16>,
	pub extra_advertised_address: Option<SocketAddr>,
	pub user_agent: String,
}

impl Default for EngineSettings {
	fn default() -> Self {
		Self {
			base_servers: Vec::new(),
			override_base_address: None,
			enable_udp_tunneling: true,
			enable_tcp_tunneling: true,
			enable_udp: true,
			enable_multicast: true,
			override_source_port: None,
			extra_advertised_address: None,
			user_agent: format!("loom-overlay/{}", env!("CARGO_PKG_VERSION")),
		}
	}
}

impl EngineSettings {
	pub fn has_base(&self) -> bool {
		self.override_base_address.is_some() || !self.base_servers.is_empty()
	}
}

/// Splits `host:port`, accepting bracketed IPv6 literals. A missing port
/// falls back to [`BASE_SERVER_PORT`].
pub fn split_host_port(address: &str) -> Option<(String, u16)> {
	if let Ok(addr) = address.parse::<SocketAddr>() {
		return Some((addr.ip().to_string(), addr.port()));
	}
	match address.rsplit_once(':') {
		Some((host, port)) if !host.contains(':') => {
			let port = port.parse().ok()?;
			(!host.is_empty()).then(|| (host.to_string(), port))
		}
		_ if !address.is_empty() => Some((
			address.trim_start_matches('[').trim_end_matches(']').to_string(),
			BASE_SERVER_PORT,
		)),
		_ => None,
	}
}
