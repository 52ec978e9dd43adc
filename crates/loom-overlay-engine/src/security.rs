// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Authenticated encryption between overlay peers.
//!
//! Sessions are set up with a three-step signed hello (initiate, respond,
//! confirm). Each hello carries the sender's per-peer X25519 public key and a
//! sequence number. The responding side must echo the number it received, so
//! a hello captured earlier cannot complete a new handshake. Payloads sent
//! before a session exists wait in a small bounded queue.

use crate::ngsocket::NgSocket;
use crate::outbox::Outbox;
use crate::peers::{PeerHandle, PeerRegistry};
use crate::session::{mix_flags, open, seal, KxRole};
use loom_overlay_common::{DeviceAddress, Identity, PeerFlags};
use loom_overlay_conn::since;
use loom_overlay_wire::{HelloStep, SecurityHello, SecurityPacket, WireError, HEARTBEAT_TOKEN_LEN, NONCE_LEN};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Packets held across all peers while handshakes are pending.
pub const MAX_QUEUED_PACKETS: usize = 10;

/// Largest upper-layer payload accepted for encryption.
pub const MAX_PAYLOAD_LEN: usize = 2000;

/// A latency sample older than this is not reported.
pub const LATENCY_TIMEOUT: Duration = Duration::from_secs(10);

const HELLOSEQ_EPOCH_MASK: u64 = 0xFFFF_FFFF_0000_0000;

pub struct SecurityLayer {
	identity: Arc<Identity>,
	flags: PeerFlags,
	helloseq: u64,
	queued_packets: usize,
}

impl SecurityLayer {
	pub fn new(identity: Arc<Identity>) -> Self {
		Self {
			identity,
			flags: PeerFlags::default(),
			helloseq: OsRng.next_u64() & HELLOSEQ_EPOCH_MASK,
			queued_packets: 0,
		}
	}

	pub fn queued_packets(&self) -> usize {
		self.queued_packets
	}

	/// The random high half survives restarts of the counter in the low half.
	fn bump_helloseq(&mut self) {
		let low = (self.helloseq as u32).wrapping_add(1);
		self.helloseq = (self.helloseq & HELLOSEQ_EPOCH_MASK) | u64::from(low);
	}

	/// Encrypts and sends `payload`, or queues it and starts a handshake when
	/// no session exists yet.
	#[instrument(skip_all, fields(peer = %target, len = payload.len()))]
	pub fn send(
		&mut self,
		ngsocket: &mut NgSocket,
		peers: &mut PeerRegistry,
		target: DeviceAddress,
		payload: &[u8],
		now: Instant,
		out: &mut Outbox,
	) {
		if payload.len() > MAX_PAYLOAD_LEN {
			warn!(max = MAX_PAYLOAD_LEN, "payload too large, dropping packet");
			return;
		}
		let Some(handle) = peers.get_or_create(&target) else {
			debug!("refusing to send to peer");
			return;
		};

		let peer = peers.peer_mut(handle);
		match peer.keys.as_ref() {
			Some(keys) if peer.negotiated => {
				let counter = peer.tx_counter;
				let sealed = seal(&keys.tx, counter, payload);
				peer.tx_counter = counter.wrapping_add(1);
				match sealed {
					Ok((nonce, ciphertext)) => {
						let frame = SecurityPacket::encode_data(&nonce, &ciphertext);
						ngsocket.send_data_packet(peers, target, &frame, now, out);
					}
					Err(e) => warn!(error = %e, "failed to seal packet"),
				}
			}
			_ => {
				if self.queued_packets < MAX_QUEUED_PACKETS {
					peer.packet_queue.push_back(payload.to_vec());
					self.queued_packets += 1;
				} else {
					warn!("outbound queue full, dropping packet");
				}
				self.send_hello(ngsocket, peers, handle, HelloStep::Initiate, 0, now, out);
			}
		}
	}

	/// Starts a heartbeat and returns the last measured round trip, if one
	/// completed within [`LATENCY_TIMEOUT`].
	pub fn latency(
		&mut self,
		ngsocket: &mut NgSocket,
		peers: &mut PeerRegistry,
		target: DeviceAddress,
		now: Instant,
		out: &mut Outbox,
	) -> Option<Duration> {
		let handle = peers.get_or_create(&target)?;
		let peer = peers.peer_mut(handle);

		let mut token = [0u8; HEARTBEAT_TOKEN_LEN];
		OsRng.fill_bytes(&mut token);
		peer.heartbeat_token = token;
		peer.last_latency_sent = Some(now);

		let latency = if since(now, peer.last_latency_received) > LATENCY_TIMEOUT {
			None
		} else {
			peer.latency
		};

		ngsocket.send_data_packet(peers, target, &SecurityPacket::encode_heartbeat(false, &token), now, out);
		latency
	}

	#[allow(clippy::too_many_arguments)]
	fn send_hello(
		&self,
		ngsocket: &mut NgSocket,
		peers: &mut PeerRegistry,
		handle: PeerHandle,
		step: HelloStep,
		echoed_helloseq: u64,
		now: Instant,
		out: &mut Outbox,
	) {
		let peer = peers.peer(handle);
		let target = peer.id();
		let hello = SecurityHello {
			step,
			sender: self.identity.address(),
			kx_public: *peer.kx().public(),
			recipient: target,
			helloseq: self.helloseq,
			echoed_helloseq,
			flags: Some(self.flags),
		};
		trace!(peer = %target, ?step, helloseq = self.helloseq, "sending security hello");
		ngsocket.send_data_packet(peers, target, &hello.encode(&self.identity), now, out);
	}

	/// Handles a frame the transport received from `source`.
	pub fn frame_received(
		&mut self,
		ngsocket: &mut NgSocket,
		peers: &mut PeerRegistry,
		source: DeviceAddress,
		frame: &[u8],
		now: Instant,
		out: &mut Outbox,
	) {
		let Some(handle) = peers.get_or_create(&source) else {
			trace!(peer = %source, "frame from refused peer");
			return;
		};

		let packet = match SecurityPacket::decode(frame) {
			Ok(packet) => packet,
			Err(WireError::BadSignature) => {
				info!(peer = %source, "forged hello");
				return;
			}
			Err(e) => {
				debug!(peer = %source, error = %e, "dropping malformed security frame");
				return;
			}
		};

		match packet {
			SecurityPacket::Data { nonce, ciphertext } => {
				self.data_received(ngsocket, peers, handle, &nonce, &ciphertext, now, out)
			}
			SecurityPacket::Hello(hello) => {
				if hello.sender != source {
					debug!(peer = %source, sender = %hello.sender, "hello relayed for another device");
					return;
				}
				if hello.recipient != self.identity.address() {
					debug!(peer = %source, "misdirected security hello");
					return;
				}
				self.hello_received(ngsocket, peers, handle, hello, now, out);
			}
			SecurityPacket::Heartbeat(token) => {
				ngsocket.send_data_packet(peers, source, &SecurityPacket::encode_heartbeat(true, &token), now, out);
			}
			SecurityPacket::HeartbeatReply(token) => {
				let peer = peers.peer_mut(handle);
				if token != peer.heartbeat_token {
					return;
				}
				if let Some(sent) = peer.last_latency_sent {
					let latency = now.saturating_duration_since(sent);
					trace!(peer = %source, latency_ms = latency.as_millis() as u64, "heartbeat reply");
					peer.latency = Some(latency);
					peer.last_latency_received = Some(now);
				}
			}
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn data_received(
		&mut self,
		ngsocket: &mut NgSocket,
		peers: &mut PeerRegistry,
		handle: PeerHandle,
		nonce: &[u8; NONCE_LEN],
		ciphertext: &[u8],
		now: Instant,
		out: &mut Outbox,
	) {
		let peer = peers.peer_mut(handle);
		let source = peer.id();
		let keys = match peer.keys.as_ref() {
			Some(keys) if peer.negotiated => keys,
			_ => {
				warn!(peer = %source, "data from peer without a session, renegotiating");
				self.send_hello(ngsocket, peers, handle, HelloStep::Initiate, 0, now, out);
				return;
			}
		};

		match open(&keys.rx, nonce, ciphertext) {
			Ok((counter, payload)) => {
				if !peer.replay.accept(counter) {
					debug!(peer = %source, counter, "dropping replayed packet");
					return;
				}
				out.deliver(source, payload);
			}
			Err(e) => info!(peer = %source, error = %e, "forged packet"),
		}
	}

	fn hello_received(
		&mut self,
		ngsocket: &mut NgSocket,
		peers: &mut PeerRegistry,
		handle: PeerHandle,
		hello: SecurityHello,
		now: Instant,
		out: &mut Outbox,
	) {
		let source = hello.sender;
		if hello.step == HelloStep::Initiate {
			trace!(peer = %source, helloseq = hello.helloseq, "hello initiate");
			self.send_hello(ngsocket, peers, handle, HelloStep::Respond, hello.helloseq, now, out);
			return;
		}

		if hello.echoed_helloseq != self.helloseq {
			debug!(
				peer = %source,
				step = ?hello.step,
				echoed = hello.echoed_helloseq,
				expected = self.helloseq,
				"stale hello sequence"
			);
			return;
		}

		let role = KxRole::for_addresses(&self.identity.address(), &source);
		let peer = peers.peer_mut(handle);
		let keys = match peer.kx().derive(&hello.kx_public, role) {
			Ok(keys) => keys,
			Err(e) => {
				info!(peer = %source, error = %e, "key exchange failed");
				return;
			}
		};
		let peer_flags = hello.flags.unwrap_or_else(PeerFlags::empty);
		let keys = if peer_flags.is_empty() {
			keys
		} else {
			mix_flags(&keys, self.flags, peer_flags)
		};

		if peer.keys.as_ref() != Some(&keys) {
			peer.replay.reset();
			peer.tx_counter = 1;
		}
		let established = !peer.negotiated;
		peer.keys = Some(keys);
		peer.flags = peer_flags;
		peer.negotiated = true;
		if established {
			info!(peer = %source, flags = ?peer_flags, "established secure connection");
		}

		self.bump_helloseq();
		if hello.step == HelloStep::Respond {
			self.send_hello(ngsocket, peers, handle, HelloStep::Confirm, hello.helloseq, now, out);
		}
		self.flush_queue(ngsocket, peers, handle, now, out);
	}

	fn flush_queue(
		&mut self,
		ngsocket: &mut NgSocket,
		peers: &mut PeerRegistry,
		handle: PeerHandle,
		now: Instant,
		out: &mut Outbox,
	) {
		let peer = peers.peer_mut(handle);
		let target = peer.id();
		let queued: Vec<Vec<u8>> = peer.packet_queue.drain(..).collect();
		if queued.is_empty() {
			return;
		}
		self.queued_packets = self.queued_packets.saturating_sub(queued.len());
		debug!(peer = %target, count = queued.len(), "flushing queued packets");
		for payload in queued {
			self.send(ngsocket, peers, target, &payload, now, out);
		}
	}
}
