// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Peer registry: an arena of [`Peer`] records addressed by [`PeerHandle`],
//! indexed by device address and by observed source address.

use crate::policy::PeerPolicy;
use crate::session::{KxKeypair, ReplayWindow, SessionKeys};
use loom_overlay_common::{DeviceAddress, PeerFlags};
use loom_overlay_conn::{since, TEARDOWN_TIMEOUT};
use loom_overlay_wire::{HelloCookie, HEARTBEAT_TOKEN_LEN};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub const MAX_SOURCE_ADDRESSES: usize = 5;
pub const MAX_ADDRESSES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(u32);

#[derive(Debug)]
pub struct Peer {
	id: DeviceAddress,

	pub target_address: Option<SocketAddr>,
	pub target_addresses: Vec<SocketAddr>,
	pub link_local_address: Option<SocketAddr>,
	source_addresses: BTreeSet<SocketAddr>,
	pub connected: bool,
	pub reestablishing: bool,
	pub hello_cookie: HelloCookie,
	pub failed_establishments: u32,
	pub last_reestablish: Option<Instant>,
	pub last_packet: Option<Instant>,

	pub negotiated: bool,
	pub flags: PeerFlags,
	pub keys: Option<SessionKeys>,
	kx: KxKeypair,
	pub tx_counter: u64,
	pub replay: ReplayWindow,
	pub packet_queue: VecDeque<Vec<u8>>,
	pub heartbeat_token: [u8; HEARTBEAT_TOKEN_LEN],
	pub last_latency_sent: Option<Instant>,
	pub last_latency_received: Option<Instant>,
	pub latency: Option<Duration>,
}

impl Peer {
	fn new(id: DeviceAddress) -> Self {
		Self {
			id,
			target_address: None,
			target_addresses: Vec::new(),
			link_local_address: None,
			source_addresses: BTreeSet::new(),
			connected: false,
			reestablishing: false,
			hello_cookie: [0; 16],
			failed_establishments: 0,
			last_reestablish: None,
			last_packet: None,
			negotiated: false,
			flags: PeerFlags::empty(),
			keys: None,
			kx: KxKeypair::generate(),
			tx_counter: 1,
			replay: ReplayWindow::default(),
			packet_queue: VecDeque::new(),
			heartbeat_token: [0; HEARTBEAT_TOKEN_LEN],
			last_latency_sent: None,
			last_latency_received: None,
			latency: None,
		}
	}

	pub fn id(&self) -> DeviceAddress {
		self.id
	}

	pub fn kx(&self) -> &KxKeypair {
		&self.kx
	}

	pub fn source_addresses(&self) -> &BTreeSet<SocketAddr> {
		&self.source_addresses
	}

	/// Active while data was sent to the peer within [`TEARDOWN_TIMEOUT`].
	pub fn is_active(&self, now: Instant) -> bool {
		since(now, self.last_packet) < TEARDOWN_TIMEOUT
	}

	/// Replaces the advertised target set. Returns whether it changed.
	pub fn set_target_addresses(&mut self, mut addresses: Vec<SocketAddr>) -> bool {
		addresses.sort();
		addresses.dedup();
		addresses.truncate(MAX_ADDRESSES);
		if addresses == self.target_addresses {
			return false;
		}
		self.target_addresses = addresses;
		true
	}
}

pub struct PeerRegistry {
	me: DeviceAddress,
	policy: Arc<dyn PeerPolicy>,
	peers: Vec<Peer>,
	by_id: HashMap<DeviceAddress, PeerHandle>,
	by_source: HashMap<SocketAddr, PeerHandle>,
}

impl PeerRegistry {
	pub fn new(me: DeviceAddress, policy: Arc<dyn PeerPolicy>) -> Self {
		Self {
			me,
			policy,
			peers: Vec::new(),
			by_id: HashMap::new(),
			by_source: HashMap::new(),
		}
	}

	fn accepts(&self, id: &DeviceAddress) -> bool {
		*id != self.me && *id != DeviceAddress::BAD && id.is_valid() && self.policy.is_peer_allowed(id)
	}

	pub fn get(&self, id: &DeviceAddress) -> Option<PeerHandle> {
		if !self.accepts(id) {
			return None;
		}
		self.by_id.get(id).copied()
	}

	pub fn get_or_create(&mut self, id: &DeviceAddress) -> Option<PeerHandle> {
		if !self.accepts(id) {
			trace!(peer = %id, "refusing peer");
			return None;
		}
		if let Some(handle) = self.by_id.get(id) {
			return Some(*handle);
		}
		let handle = PeerHandle(self.peers.len() as u32);
		self.peers.push(Peer::new(*id));
		self.by_id.insert(*id, handle);
		debug!(peer = %id, "created peer");
		Some(handle)
	}

	pub fn peer(&self, handle: PeerHandle) -> &Peer {
		&self.peers[handle.0 as usize]
	}

	pub fn peer_mut(&mut self, handle: PeerHandle) -> &mut Peer {
		&mut self.peers[handle.0 as usize]
	}

	pub fn find_by_source(&self, addr: &SocketAddr) -> Option<PeerHandle> {
		self.by_source.get(addr).copied()
	}

	/// Attributes `addr` to `handle`. A full set loses a random member, and
	/// any previous owner of `addr` loses it.
	pub fn add_source_address(&mut self, handle: PeerHandle, addr: SocketAddr) {
		if self.peer(handle).source_addresses.contains(&addr) {
			return;
		}

		if self.peer(handle).source_addresses.len() >= MAX_SOURCE_ADDRESSES {
			let victim_index = fastrand::usize(..self.peer(handle).source_addresses.len());
			let victim = self.peer(handle).source_addresses.iter().nth(victim_index).copied();
			if let Some(victim) = victim {
				self.remove_source_address(handle, &victim);
			}
		}

		if let Some(previous) = self.by_source.insert(addr, handle) {
			if previous != handle {
				self.peer_mut(previous).source_addresses.remove(&addr);
				debug!(%addr, from = %self.peer(previous).id, to = %self.peer(handle).id, "source address changed owner");
			}
		}
		self.peer_mut(handle).source_addresses.insert(addr);
	}

	pub fn remove_source_address(&mut self, handle: PeerHandle, addr: &SocketAddr) {
		self.peer_mut(handle).source_addresses.remove(addr);
		if self.by_source.get(addr) == Some(&handle) {
			self.by_source.remove(addr);
		}
	}

	pub fn is_address_allowed(&self, addr: &SocketAddr) -> bool {
		self.policy.is_address_allowed(addr)
	}

	pub fn handles(&self) -> impl Iterator<Item = PeerHandle> {
		(0..self.peers.len() as u32).map(PeerHandle)
	}

	pub fn len(&self) -> usize {
		self.peers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.peers.is_empty()
	}
}
