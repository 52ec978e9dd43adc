// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_overlay_common::DeviceAddress;
use std::net::SocketAddr;

/// Side effect requested by the sans-IO state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transmit {
	Udp { dest: SocketAddr, payload: Vec<u8> },
	/// Beacon to every multicast group.
	Multicast { payload: Vec<u8> },
	BaseConnect { host: String, port: u16 },
	BaseTcp { payload: Vec<u8> },
	/// Signed peer hello to verify off the event loop.
	Verify { source: SocketAddr, packet: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct Outbox {
	pub transmits: Vec<Transmit>,
	/// Security frames received by the transport, awaiting decryption.
	pub frames: Vec<(DeviceAddress, Vec<u8>)>,
	/// Plaintext delivered to the upper layer.
	pub inbound: Vec<(DeviceAddress, Vec<u8>)>,
}

impl Outbox {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, transmit: Transmit) {
		self.transmits.push(transmit);
	}

	pub fn frame(&mut self, source: DeviceAddress, frame: Vec<u8>) {
		self.frames.push((source, frame));
	}

	pub fn deliver(&mut self, source: DeviceAddress, payload: Vec<u8>) {
		self.inbound.push((source, payload));
	}

	pub fn is_empty(&self) -> bool {
		self.transmits.is_empty() && self.frames.is_empty() && self.inbound.is_empty()
	}

	pub fn take_frames(&mut self) -> Vec<(DeviceAddress, Vec<u8>)> {
		std::mem::take(&mut self.frames)
	}

	pub fn take_transmits(&mut self) -> Vec<Transmit> {
		std::mem::take(&mut self.transmits)
	}

	pub fn take_inbound(&mut self) -> Vec<(DeviceAddress, Vec<u8>)> {
		std::mem::take(&mut self.inbound)
	}
}
