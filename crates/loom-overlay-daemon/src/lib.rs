// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Overlay network daemon.
//!
//! Loads (or creates) the device identity, starts an [`OverlayEngine`] against
//! the configured base servers and logs inbound payloads, engine status and
//! the latency of watched peers until shutdown.
//!
//! [`OverlayEngine`]: loom_overlay_engine::OverlayEngine

pub mod config;
pub mod daemon;
pub mod error;

pub use config::OverlayConfig;
pub use daemon::OverlayDaemon;
pub use error::{ConfigError, DaemonError, Result};
