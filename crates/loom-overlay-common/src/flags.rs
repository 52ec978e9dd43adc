// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;

/// Capability bits exchanged in the security hello.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerFlags(u64);

impl PeerFlags {
	pub const SUPPORTS_FLAGS: u64 = 1;
	pub const COMPRESSION: u64 = 2;

	pub const fn empty() -> Self {
		Self(0)
	}

	pub const fn from_bits(bits: u64) -> Self {
		Self(bits)
	}

	pub const fn bits(&self) -> u64 {
		self.0
	}

	pub fn set(&mut self, flag: u64) {
		self.0 |= flag;
	}

	pub fn contains(&self, flag: u64) -> bool {
		self.0 & flag == flag
	}

	pub fn is_empty(&self) -> bool {
		self.0 == 0
	}
}

impl Default for PeerFlags {
	fn default() -> Self {
		Self(Self::SUPPORTS_FLAGS)
	}
}

impl fmt::Debug for PeerFlags {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "PeerFlags({:#x})", self.0)
	}
}
