// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::ConfigError;
use loom_overlay_common::{default_state_dir, DeviceAddress};
use loom_overlay_engine::{AllowAll, AllowList, EngineSettings, PeerPolicy};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const BASE_SERVERS_ENV: &str = "LOOM_OVERLAY_BASE_SERVERS";
pub const OVERRIDE_BASE_ADDRESS_ENV: &str = "LOOM_OVERLAY_OVERRIDE_BASE_ADDRESS";
pub const ENABLE_UDP_TUNNELING_ENV: &str = "LOOM_OVERLAY_ENABLE_UDP_TUNNELING";
pub const ENABLE_TCP_TUNNELING_ENV: &str = "LOOM_OVERLAY_ENABLE_TCP_TUNNELING";
pub const ENABLE_UDP_ENV: &str = "LOOM_OVERLAY_ENABLE_UDP";
pub const ENABLE_MULTICAST_ENV: &str = "LOOM_OVERLAY_ENABLE_MULTICAST";
pub const OVERRIDE_SOURCE_PORT_ENV: &str = "LOOM_OVERLAY_OVERRIDE_SOURCE_PORT";
pub const EXTRA_ADVERTISED_ADDRESS_ENV: &str = "LOOM_OVERLAY_EXTRA_ADVERTISED_ADDRESS";
pub const ENABLE_WHITELIST_ENV: &str = "LOOM_OVERLAY_ENABLE_WHITELIST";
pub const WHITELIST_ENV: &str = "LOOM_OVERLAY_WHITELIST";
pub const STATE_DIR_ENV: &str = "LOOM_OVERLAY_STATE_DIR";
pub const STATUS_INTERVAL_ENV: &str = "LOOM_OVERLAY_STATUS_INTERVAL_SECS";
pub const WATCH_PEERS_ENV: &str = "LOOM_OVERLAY_WATCH_PEERS";

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone)]
pub struct OverlayConfig {
	pub base_servers: Vec<String>,
	pub override_base_address: Option<String>,
	pub enable_udp_tunneling: bool,
	pub enable_tcp_tunneling: bool,
	pub enable_udp: bool,
	pub enable_multicast: bool,
	pub override_source_port: Option<u16>,
	pub extra_advertised_address: Option<SocketAddr>,
	pub enable_whitelist: bool,
	pub whitelist: Vec<DeviceAddress>,
	pub state_dir: PathBuf,
	pub status_interval: Duration,
	pub watch_peers: Vec<DeviceAddress>,
}

impl OverlayConfig {
	pub fn from_env() -> Result<Self> {
		Self::from_lookup(|name| std::env::var(name).ok())
	}

	/// Builds the configuration from `lookup`, which maps a variable name to
	/// its value. Used by the CLI to layer flags over the environment.
	pub fn from_lookup<F>(lookup: F) -> Result<Self>
	where
		F: Fn(&str) -> Option<String>,
	{
		let env = Lookup(lookup);

		let override_base_address = env.optional_env(OVERRIDE_BASE_ADDRESS_ENV);
		let base_servers = match override_base_address {
			Some(_) => env.optional_env(BASE_SERVERS_ENV).map(|s| split_list(&s)).unwrap_or_default(),
			None => split_list(&env.require_env(BASE_SERVERS_ENV)?),
		};
		if base_servers.is_empty() && override_base_address.is_none() {
			return Err(ConfigError::InvalidValue {
				name: BASE_SERVERS_ENV.into(),
				message: "must name at least one base server".into(),
			});
		}

		let override_source_port = env.optional_env_parse::<u16>(OVERRIDE_SOURCE_PORT_ENV)?;
		if override_source_port == Some(0) {
			return Err(ConfigError::InvalidValue {
				name: OVERRIDE_SOURCE_PORT_ENV.into(),
				message: "port must be non-zero".into(),
			});
		}

		let status_interval_secs: u64 = env.optional_env_parse(STATUS_INTERVAL_ENV)?.unwrap_or(30);
		if status_interval_secs == 0 {
			return Err(ConfigError::InvalidValue {
				name: STATUS_INTERVAL_ENV.into(),
				message: "interval must be at least one second".into(),
			});
		}

		let state_dir = match env.optional_env(STATE_DIR_ENV) {
			Some(dir) => PathBuf::from(dir),
			None => default_state_dir().map_err(|e| ConfigError::InvalidValue {
				name: STATE_DIR_ENV.into(),
				message: e.to_string(),
			})?,
		};

		Ok(Self {
			base_servers,
			override_base_address,
			enable_udp_tunneling: env.flag(ENABLE_UDP_TUNNELING_ENV, true),
			enable_tcp_tunneling: env.flag(ENABLE_TCP_TUNNELING_ENV, true),
			enable_udp: env.flag(ENABLE_UDP_ENV, true),
			enable_multicast: env.flag(ENABLE_MULTICAST_ENV, true),
			override_source_port,
			extra_advertised_address: env.optional_env_parse(EXTRA_ADVERTISED_ADDRESS_ENV)?,
			enable_whitelist: env.flag(ENABLE_WHITELIST_ENV, false),
			whitelist: env.device_list(WHITELIST_ENV)?,
			state_dir,
			status_interval: Duration::from_secs(status_interval_secs),
			watch_peers: env.device_list(WATCH_PEERS_ENV)?,
		})
	}

	pub fn engine_settings(&self) -> EngineSettings {
		EngineSettings {
			base_servers: self.base_servers.clone(),
			override_base_address: self.override_base_address.clone(),
			enable_udp_tunneling: self.enable_udp_tunneling,
			enable_tcp_tunneling: self.enable_tcp_tunneling,
			enable_udp: self.enable_udp,
			enable_multicast: self.enable_multicast,
			override_source_port: self.override_source_port,
			extra_advertised_address: self.extra_advertised_address,
			..EngineSettings::default()
		}
	}

	pub fn policy(&self) -> Arc<dyn PeerPolicy> {
		if self.enable_whitelist {
			Arc::new(AllowList::new(self.whitelist.iter().copied()))
		} else {
			Arc::new(AllowAll)
		}
	}
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
	F: Fn(&str) -> Option<String>,
{
	fn require_env(&self, name: &str) -> Result<String> {
		self.optional_env(name)
			.ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
	}

	fn optional_env(&self, name: &str) -> Option<String> {
		(self.0)(name)
			.map(|v| v.trim().to_string())
			.filter(|v| !v.is_empty())
	}

	fn optional_env_parse<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>>
	where
		T::Err: std::fmt::Display,
	{
		self.optional_env(name)
			.map(|val| {
				val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
					name: name.to_string(),
					message: e.to_string(),
				})
			})
			.transpose()
	}

	fn flag(&self, name: &str, default: bool) -> bool {
		match self.optional_env(name) {
			Some(v) if default => v != "0" && v.to_lowercase() != "false",
			Some(v) => v == "true" || v == "1",
			None => default,
		}
	}

	fn device_list(&self, name: &str) -> Result<Vec<DeviceAddress>> {
		let Some(raw) = self.optional_env(name) else {
			return Ok(Vec::new());
		};
		split_list(&raw)
			.iter()
			.map(|item| {
				item.parse().map_err(|e: loom_overlay_common::DeviceAddressError| {
					ConfigError::InvalidValue {
						name: name.to_string(),
						message: e.to_string(),
					}
				})
			})
			.collect()
	}
}

fn split_list(raw: &str) -> Vec<String> {
	raw.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(str::to_string)
		.collect()
}
