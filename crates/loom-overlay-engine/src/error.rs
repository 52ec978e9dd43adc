// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("connection error: {0}")]
	Conn(#[from] loom_overlay_conn::ConnError),

	#[error("wire error: {0}")]
	Wire(#[from] loom_overlay_wire::WireError),

	#[error("session error: {0}")]
	Session(#[from] SessionError),

	#[error("peer not allowed: {0}")]
	PeerNotAllowed(String),

	#[error("no base server configured")]
	NoBaseServers,

	#[error("already running")]
	AlreadyRunning,

	#[error("not running")]
	NotRunning,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
	#[error("key exchange produced a non-contributory secret")]
	NonContributory,

	#[error("encryption failed")]
	Seal,

	#[error("authentication failed")]
	Forged,

	#[error("decrypted frame is truncated")]
	Truncated,
}

pub type Result<T> = std::result::Result<T, EngineError>;
