// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_overlay_common::DeviceAddress;
use std::collections::HashSet;
use std::net::SocketAddr;

/// Admission callbacks consulted by the registry and the path prober.
pub trait PeerPolicy: Send + Sync {
	fn is_peer_allowed(&self, _peer: &DeviceAddress) -> bool {
		true
	}

	fn is_address_allowed(&self, _addr: &SocketAddr) -> bool {
		true
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PeerPolicy for AllowAll {}

/// Only peers on the list may be contacted. Addresses are unrestricted.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
	peers: HashSet<DeviceAddress>,
}

impl AllowList {
	pub fn new(peers: impl IntoIterator<Item = DeviceAddress>) -> Self {
		Self {
			peers: peers.into_iter().collect(),
		}
	}
}

impl PeerPolicy for AllowList {
	fn is_peer_allowed(&self, peer: &DeviceAddress) -> bool {
		self.peers.contains(peer)
	}
}
