// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("wire error: {0}")]
	Wire(#[from] loom_overlay_wire::WireError),

	#[error("failed to bind UDP port {port}: {source}")]
	Bind {
		port: u16,
		#[source]
		source: std::io::Error,
	},

	#[error("no UDP port available in {start}..{end}")]
	PortRangeExhausted { start: u16, end: u16 },

	#[error("could not resolve base address {0}")]
	Resolve(String),

	#[error("connection to base timed out")]
	ConnectTimeout,
}

pub type Result<T> = std::result::Result<T, ConnError>;
