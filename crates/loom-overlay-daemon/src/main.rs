// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use loom_overlay_daemon::config::{BASE_SERVERS_ENV, STATE_DIR_ENV};
use loom_overlay_daemon::{OverlayConfig, OverlayDaemon};

#[derive(Parser, Debug)]
#[command(name = "loom-overlay", version, about = "Peer-to-peer overlay network daemon")]
struct Args {
	/// Directory holding the device identity
	#[arg(long)]
	state_dir: Option<PathBuf>,

	/// Comma separated base server hostnames
	#[arg(long)]
	base_servers: Option<String>,

	/// Log verbosity when RUST_LOG is unset
	#[arg(long, env = "LOOM_OVERLAY_LOG", default_value = "info")]
	log: String,

	/// Output logs as JSON
	#[arg(long, env = "LOOM_OVERLAY_JSON_LOGS")]
	json_logs: bool,
}

fn init_logging(level: &str, json: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
	if json {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer().json())
			.init();
	} else {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer())
			.init();
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();
	init_logging(&args.log, args.json_logs);

	info!("starting loom-overlay");

	let config = OverlayConfig::from_lookup(|name| match name {
		STATE_DIR_ENV if args.state_dir.is_some() => {
			args.state_dir.as_ref().map(|dir| dir.display().to_string())
		}
		BASE_SERVERS_ENV if args.base_servers.is_some() => args.base_servers.clone(),
		_ => std::env::var(name).ok(),
	})?;
	info!(
		base_servers = ?config.base_servers,
		override_base_address = ?config.override_base_address,
		state_dir = %config.state_dir.display(),
		"loaded configuration"
	);

	let daemon = match OverlayDaemon::new(config).await {
		Ok(daemon) => Arc::new(daemon),
		Err(e) => {
			error!(error = %e, "failed to start overlay daemon");
			return Err(e.into());
		}
	};

	let signal_daemon = daemon.clone();
	tokio::spawn(async move {
		match tokio::signal::ctrl_c().await {
			Ok(()) => info!("received shutdown signal"),
			Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
		}
		signal_daemon.shutdown();
	});

	daemon.run().await?;
	Ok(())
}
