// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::cursor::Reader;
use crate::error::Result;
use bytes::BufMut;
use loom_overlay_common::DeviceAddress;

pub const BEACON_LEN: usize = 2 + 16;

/// Link-local presence announcement: `[sourcePort:2][deviceAddr:16]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
	pub port: u16,
	pub device: DeviceAddress,
}

impl Beacon {
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(BEACON_LEN);
		buf.put_u16(self.port);
		buf.put_slice(self.device.as_bytes());
		buf
	}

	/// Trailing bytes beyond the fixed layout are ignored.
	pub fn decode(data: &[u8]) -> Result<Self> {
		let mut reader = Reader::new(0, data);
		Ok(Self {
			port: reader.u16()?,
			device: reader.device_address()?,
		})
	}
}
