// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::OverlayConfig;
use crate::error::Result;
use loom_overlay_common::{get_or_create_identity, DeviceAddress};
use loom_overlay_engine::{Delivery, OverlayEngine, OverlayEngineConfig};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

const DELIVERY_QUEUE: usize = 1024;

pub struct OverlayDaemon {
	engine: OverlayEngine,
	config: OverlayConfig,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl OverlayDaemon {
	/// Loads the identity from the state directory and binds the engine sockets.
	#[instrument(skip(config), fields(state_dir = %config.state_dir.display()))]
	pub async fn new(config: OverlayConfig) -> Result<Self> {
		let identity = Arc::new(get_or_create_identity(&config.state_dir).await?);
		info!(device = %identity.address(), "loaded identity");

		let mut engine_config = OverlayEngineConfig::new(identity, config.engine_settings());
		engine_config.policy = config.policy();
		let engine = OverlayEngine::new(engine_config).await?;

		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		Ok(Self {
			engine,
			config,
			shutdown_tx,
			shutdown_rx,
		})
	}

	pub fn address(&self) -> DeviceAddress {
		self.engine.address()
	}

	pub fn engine(&self) -> &OverlayEngine {
		&self.engine
	}

	pub fn shutdown(&self) {
		let _ = self.shutdown_tx.send(true);
	}

	/// Runs the engine until [`OverlayDaemon::shutdown`] is called.
	#[instrument(skip(self), fields(device = %self.address()))]
	pub async fn run(&self) -> Result<()> {
		let (delivery_tx, mut delivery_rx) = mpsc::channel(DELIVERY_QUEUE);
		self.engine.start(delivery_tx)?;

		info!(
			source_port = self.engine.source_port(),
			watched = self.config.watch_peers.len(),
			"overlay daemon started"
		);

		let mut status_timer = tokio::time::interval(self.config.status_interval);
		status_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		let mut shutdown_rx = self.shutdown_rx.clone();

		loop {
			tokio::select! {
				biased;

				changed = shutdown_rx.changed() => {
					if changed.is_err() || *shutdown_rx.borrow() {
						info!("shutdown signal received");
						break;
					}
				}

				delivery = delivery_rx.recv() => match delivery {
					Some(delivery) => log_delivery(&delivery),
					None => {
						warn!("engine stopped delivering packets");
						break;
					}
				},

				_ = status_timer.tick() => self.report_status().await,
			}
		}

		self.engine.shutdown().await;
		info!("overlay daemon stopped");
		Ok(())
	}

	async fn report_status(&self) {
		match self.engine.status().await {
			Ok(status) => match serde_json::to_string(&status) {
				Ok(json) => info!(status = %json, "engine status"),
				Err(e) => warn!(error = %e, "failed to encode engine status"),
			},
			Err(e) => {
				warn!(error = %e, "failed to query engine status");
				return;
			}
		}

		for &peer in &self.config.watch_peers {
			let latency = match self.engine.latency(peer).await {
				Ok(latency) => latency,
				Err(e) => {
					warn!(error = %e, %peer, "failed to probe peer");
					continue;
				}
			};
			let path = self
				.engine
				.peer_status(peer)
				.await
				.ok()
				.flatten()
				.and_then(|status| serde_json::to_string(&status).ok());
			match latency {
				Some(rtt) => info!(%peer, latency_ms = rtt.as_millis() as u64, path = ?path, "peer latency"),
				None => info!(%peer, path = ?path, "peer latency unknown"),
			}
		}
	}
}

fn log_delivery(delivery: &Delivery) {
	debug!(source = %delivery.source, len = delivery.payload.len(), "received packet");
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::Path;
	use std::time::Duration;
	use tempfile::TempDir;

	fn test_config(state_dir: &Path) -> OverlayConfig {
		OverlayConfig {
			base_servers: Vec::new(),
			override_base_address: Some("127.0.0.1:9".to_string()),
			enable_udp_tunneling: true,
			enable_tcp_tunneling: true,
			enable_udp: true,
			enable_multicast: false,
			override_source_port: None,
			extra_advertised_address: None,
			enable_whitelist: false,
			whitelist: Vec::new(),
			state_dir: state_dir.to_path_buf(),
			status_interval: Duration::from_millis(50),
			watch_peers: Vec::new(),
		}
	}

	#[tokio::test]
	async fn test_new_persists_identity() {
		let dir = TempDir::new().unwrap();

		let first = OverlayDaemon::new(test_config(dir.path())).await.unwrap();
		let address = first.address();
		drop(first);

		assert!(dir.path().join(loom_overlay_common::IDENTITY_FILE_NAME).exists());

		let second = OverlayDaemon::new(test_config(dir.path())).await.unwrap();
		assert_eq!(second.address(), address);
	}

	#[tokio::test]
	async fn test_run_until_shutdown() {
		let dir = TempDir::new().unwrap();
		let mut config = test_config(dir.path());
		config.watch_peers = vec![loom_overlay_common::Identity::generate().address()];

		let daemon = Arc::new(OverlayDaemon::new(config).await.unwrap());
		let runner = {
			let daemon = daemon.clone();
			tokio::spawn(async move { daemon.run().await })
		};

		tokio::time::sleep(Duration::from_millis(200)).await;
		assert!(daemon.engine().is_running());

		daemon.shutdown();
		let result = tokio::time::timeout(Duration::from_secs(5), runner)
			.await
			.unwrap()
			.unwrap();
		assert!(result.is_ok());
		assert!(!daemon.engine().is_running());
	}

	#[test]
	fn test_requires_base() {
		let dir = TempDir::new().unwrap();
		let mut config = test_config(dir.path());
		config.override_base_address = None;

		let result = tokio_test::block_on(OverlayDaemon::new(config));
		assert!(matches!(
			result,
			Err(crate::DaemonError::Engine(loom_overlay_engine::EngineError::NoBaseServers))
		));
	}
}
