// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum WireError {
	#[error("empty message")]
	Empty,

	#[error("invalid message kind: {0}")]
	InvalidKind(u8),

	#[error("payload too short for message kind {0}")]
	PayloadTooShort(u8),

	#[error("invalid length {len} for message kind {kind}")]
	InvalidLength { kind: u8, len: usize },

	#[error("sender address does not match its public key")]
	AddressMismatch,

	#[error("signature verification failed")]
	BadSignature,

	#[error("frame too large: {0} bytes (max {1})")]
	FrameTooLarge(usize, usize),

	#[error("invalid frame tag: {0:02x?}")]
	InvalidFrameTag([u8; 3]),

	#[error("connection closed")]
	ConnectionClosed,

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;
