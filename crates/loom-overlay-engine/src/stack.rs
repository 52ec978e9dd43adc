// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The transport and security layers joined over one peer registry.
//!
//! Frames the transport receives are handed to the security layer before an
//! entry point returns, so callers only see transmits and plaintext in the
//! [`Outbox`].

use crate::ngsocket::NgSocket;
use crate::outbox::Outbox;
use crate::peers::PeerRegistry;
use crate::policy::PeerPolicy;
use crate::security::SecurityLayer;
use crate::settings::EngineSettings;
use crate::status::{EngineStatus, PeerStatus};
use loom_overlay_common::{DeviceAddress, Identity};
use loom_overlay_wire::PeerMessage;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct OverlayStack {
	identity: Arc<Identity>,
	peers: PeerRegistry,
	ngsocket: NgSocket,
	security: SecurityLayer,
}

impl OverlayStack {
	pub fn new(
		identity: Arc<Identity>,
		settings: EngineSettings,
		source_port: u16,
		policy: Arc<dyn PeerPolicy>,
	) -> Self {
		Self {
			peers: PeerRegistry::new(identity.address(), policy),
			ngsocket: NgSocket::new(identity.clone(), settings, source_port),
			security: SecurityLayer::new(identity.clone()),
			identity,
		}
	}

	pub fn identity(&self) -> &Arc<Identity> {
		&self.identity
	}

	pub fn peers(&self) -> &PeerRegistry {
		&self.peers
	}

	pub fn ngsocket(&self) -> &NgSocket {
		&self.ngsocket
	}

	fn pump(&mut self, now: Instant, out: &mut Outbox) {
		loop {
			let frames = out.take_frames();
			if frames.is_empty() {
				break;
			}
			for (source, frame) in frames {
				self.security.frame_received(
					&mut self.ngsocket,
					&mut self.peers,
					source,
					&frame,
					now,
					out,
				);
			}
		}
	}

	pub fn periodic(&mut self, now: Instant, interface_ips: &[IpAddr], out: &mut Outbox) {
		self.ngsocket
			.periodic(&mut self.peers, now, interface_ips, out);
		self.pump(now, out);
	}

	pub fn send(&mut self, target: DeviceAddress, payload: &[u8], now: Instant, out: &mut Outbox) {
		self.security
			.send(&mut self.ngsocket, &mut self.peers, target, payload, now, out);
		self.pump(now, out);
	}

	pub fn latency(&mut self, target: DeviceAddress, now: Instant, out: &mut Outbox) -> Option<Duration> {
		self.security
			.latency(&mut self.ngsocket, &mut self.peers, target, now, out)
	}

	pub fn udp_packet_received(&mut self, source: SocketAddr, data: &[u8], now: Instant, out: &mut Outbox) {
		self.ngsocket
			.udp_packet_received(&mut self.peers, source, data, now, out);
		self.pump(now, out);
	}

	/// Continues processing a hello that passed signature verification.
	pub fn verified_packet_received(
		&mut self,
		source: SocketAddr,
		message: PeerMessage,
		now: Instant,
		out: &mut Outbox,
	) {
		self.ngsocket
			.peer_message_received(&mut self.peers, source, message, now, out);
		self.pump(now, out);
	}

	pub fn multicast_packet_received(&mut self, source: SocketAddr, data: &[u8], now: Instant, out: &mut Outbox) {
		self.ngsocket
			.multicast_packet_received(&mut self.peers, source, data, now, out);
	}

	pub fn base_tcp_connected(&mut self, address: SocketAddr) {
		self.ngsocket.base_tcp_connected(address);
	}

	pub fn base_tcp_message(&mut self, data: &[u8], now: Instant, out: &mut Outbox) {
		self.ngsocket
			.base_tcp_message(&mut self.peers, data, now, out);
		self.pump(now, out);
	}

	pub fn base_tcp_closed(&mut self, now: Instant) {
		self.ngsocket.base_tcp_closed(now);
	}

	pub fn status(&self, now: Instant) -> EngineStatus {
		EngineStatus {
			device: self.identity.address().to_string(),
			source_port: self.ngsocket.source_port(),
			base_connection: self.ngsocket.base_connection_type(now),
			base_address: self.ngsocket.base_address(),
			base_udp_age_ms: self.ngsocket.base_udp_age(now).map(|age| age.as_millis() as u64),
			local_addresses: self.ngsocket.local_addresses().to_vec(),
			peers: self.peers.len(),
			queued_packets: self.security.queued_packets(),
		}
	}

	pub fn peer_status(&self, device: &DeviceAddress, now: Instant) -> Option<PeerStatus> {
		let peer = self.peers.peer(self.peers.get(device)?);
		Some(PeerStatus {
			device: device.to_string(),
			active: peer.is_active(now),
			connected: peer.connected,
			negotiated: peer.negotiated,
			reestablishing: peer.reestablishing,
			target_address: peer.target_address,
			link_local_address: peer.link_local_address,
			target_addresses: peer.target_addresses.clone(),
			source_addresses: peer.source_addresses().iter().copied().collect(),
			failed_establishments: peer.failed_establishments,
			latency_ms: peer.latency.map(|l| l.as_millis() as u64),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ngsocket::BaseConnectionType;
	use crate::outbox::Transmit;
	use crate::policy::{AllowAll, AllowList};
	use loom_overlay_wire::{BaseToPeer, PeerToBase};
	use std::collections::{HashMap, VecDeque};

	const BASE: &str = "192.0.2.200:443";

	struct Node {
		stack: OverlayStack,
		udp: SocketAddr,
		interfaces: Vec<IpAddr>,
		inbound: Vec<(DeviceAddress, Vec<u8>)>,
	}

	/// Nodes joined by an in-memory base server that relays DATA and answers
	/// address lookups.
	struct Network {
		nodes: Vec<Node>,
		now: Instant,
		direct_udp: bool,
		base_sessions: HashMap<DeviceAddress, usize>,
		advertised: HashMap<DeviceAddress, Vec<SocketAddr>>,
		pending: VecDeque<(usize, Transmit)>,
	}

	impl Network {
		fn new(count: usize, direct_udp: bool) -> Self {
			let settings = EngineSettings {
				base_servers: vec!["base.example.com".to_string()],
				..EngineSettings::default()
			};
			let nodes = (0..count)
				.map(|i| {
					let identity = Arc::new(Identity::generate());
					let ip: IpAddr = format!("10.0.0.{}", i + 1).parse().unwrap();
					Node {
						stack: OverlayStack::new(identity, settings.clone(), 5582, Arc::new(AllowAll)),
						udp: SocketAddr::new(ip, 5582),
						interfaces: vec![ip],
						inbound: Vec::new(),
					}
				})
				.collect();
			let mut network = Self {
				nodes,
				now: Instant::now(),
				direct_udp,
				base_sessions: HashMap::new(),
				advertised: HashMap::new(),
				pending: VecDeque::new(),
			};
			for i in 0..count {
				network.with_outbox(i, |stack, now, interfaces, out| {
					stack.periodic(now, interfaces, out)
				});
			}
			network.run();
			network
		}

		fn id(&self, i: usize) -> DeviceAddress {
			self.nodes[i].stack.identity().address()
		}

		fn with_outbox<F>(&mut self, i: usize, f: F)
		where
			F: FnOnce(&mut OverlayStack, Instant, &[IpAddr], &mut Outbox),
		{
			let mut out = Outbox::new();
			let node = &mut self.nodes[i];
			f(&mut node.stack, self.now, &node.interfaces, &mut out);
			node.inbound.extend(out.take_inbound());
			self.pending
				.extend(out.take_transmits().into_iter().map(|t| (i, t)));
		}

		fn send(&mut self, from: usize, to: usize, payload: &[u8]) {
			let target = self.id(to);
			self.with_outbox(from, |stack, now, _, out| stack.send(target, payload, now, out));
		}

		fn base_deliver(&mut self, to: usize, message: BaseToPeer) {
			let data = message.encode();
			self.with_outbox(to, |stack, now, _, out| stack.base_tcp_message(&data, now, out));
		}

		fn run(&mut self) {
			let mut steps = 0;
			while let Some((from, transmit)) = self.pending.pop_front() {
				steps += 1;
				assert!(steps < 10_000, "network did not settle");
				self.dispatch(from, transmit);
			}
		}

		fn dispatch(&mut self, from: usize, transmit: Transmit) {
			match transmit {
				Transmit::BaseConnect { .. } => {
					self.nodes[from].stack.base_tcp_connected(BASE.parse().unwrap());
					let id = self.id(from);
					self.base_sessions.insert(id, from);
					self.base_deliver(from, BaseToPeer::Hello { cookie: [from as u8; 16] });
				}
				Transmit::BaseTcp { payload } => {
					let Ok(envelope) = PeerToBase::decode(&payload) else {
						return;
					};
					let Some(sender) = envelope.sender else {
						return;
					};
					match envelope.message {
						PeerToBase::Info { addresses } => {
							self.advertised.insert(sender, addresses);
						}
						PeerToBase::RequestInfo { device } => {
							if let Some(addresses) = self.advertised.get(&device).cloned() {
								self.base_deliver(from, BaseToPeer::DeviceAddresses { device, addresses });
							}
						}
						PeerToBase::Data { target, payload } => {
							if let Some(&to) = self.base_sessions.get(&target) {
								self.base_deliver(to, BaseToPeer::Data { source: sender, payload });
							}
						}
						_ => {}
					}
				}
				Transmit::Udp { dest, payload } => {
					if !self.direct_udp {
						return;
					}
					let source = self.nodes[from].udp;
					if let Some(to) = self.nodes.iter().position(|n| n.udp == dest) {
						self.with_outbox(to, |stack, now, _, out| {
							stack.udp_packet_received(source, &payload, now, out)
						});
					}
				}
				Transmit::Verify { source, packet } => {
					if let Ok(message) = PeerMessage::decode(&packet) {
						self.with_outbox(from, |stack, now, _, out| {
							stack.verified_packet_received(source, message, now, out)
						});
					}
				}
				Transmit::Multicast { .. } => {}
			}
		}

		fn udp_sends(&mut self, from: usize, to: usize, payload: &[u8]) -> bool {
			let target = self.id(to);
			let dest = self.nodes[to].udp;
			let mut out = Outbox::new();
			let now = self.now;
			self.nodes[from].stack.send(target, payload, now, &mut out);
			let direct = out
				.transmits
				.iter()
				.any(|t| matches!(t, Transmit::Udp { dest: d, .. } if *d == dest));
			self.pending
				.extend(out.take_transmits().into_iter().map(|t| (from, t)));
			direct
		}
	}

	#[test]
	fn test_first_packet_is_delivered_through_relay() {
		let mut net = Network::new(2, false);
		assert_eq!(
			net.nodes[0].stack.status(net.now).base_connection,
			BaseConnectionType::Tcp
		);

		net.send(0, 1, b"ping");
		net.run();

		let a = net.id(0);
		assert_eq!(net.nodes[1].inbound, vec![(a, b"ping".to_vec())]);
		let status = net.nodes[0].stack.peer_status(&net.id(1), net.now).unwrap();
		assert!(status.negotiated);
		assert!(!status.connected);
		assert_eq!(net.nodes[0].stack.status(net.now).queued_packets, 0);

		net.send(1, 0, b"pong");
		net.run();
		assert_eq!(net.nodes[0].inbound, vec![(net.id(1), b"pong".to_vec())]);
	}

	#[test]
	fn test_direct_path_replaces_relay() {
		let mut net = Network::new(2, true);
		net.send(0, 1, b"ping");
		net.run();
		assert_eq!(net.nodes[1].inbound.len(), 1);

		let status = net.nodes[0].stack.peer_status(&net.id(1), net.now).unwrap();
		assert!(status.connected);
		assert_eq!(status.target_address, Some(net.nodes[1].udp));
		assert!(status.source_addresses.contains(&net.nodes[1].udp));

		assert!(net.udp_sends(0, 1, b"direct"));
		net.run();
		assert_eq!(net.nodes[1].inbound.last().unwrap().1, b"direct".to_vec());
	}

	#[test]
	fn test_simultaneous_first_packets() {
		let mut net = Network::new(2, false);
		net.send(0, 1, b"from a");
		net.send(1, 0, b"from b");
		net.run();

		assert_eq!(net.nodes[1].inbound, vec![(net.id(0), b"from a".to_vec())]);
		assert_eq!(net.nodes[0].inbound, vec![(net.id(1), b"from b".to_vec())]);
	}

	#[test]
	fn test_three_peers_keep_separate_sessions() {
		let mut net = Network::new(3, false);
		net.send(0, 1, b"to b");
		net.run();
		net.send(0, 2, b"to c");
		net.run();
		assert_eq!(net.nodes[1].inbound, vec![(net.id(0), b"to b".to_vec())]);
		assert_eq!(net.nodes[2].inbound, vec![(net.id(0), b"to c".to_vec())]);
	}

	#[test]
	fn test_interleaved_handshakes_recover_on_next_send() {
		let mut net = Network::new(3, false);
		net.send(0, 1, b"to b");
		net.send(0, 2, b"to c");
		net.run();
		assert_eq!(net.nodes[1].inbound.len(), 1);
		assert!(net.nodes[2].inbound.is_empty());
		assert_eq!(net.nodes[0].stack.status(net.now).queued_packets, 1);

		net.send(0, 2, b"again");
		net.run();
		let payloads: Vec<_> = net.nodes[2].inbound.iter().map(|(_, p)| p.clone()).collect();
		assert_eq!(payloads, vec![b"to c".to_vec(), b"again".to_vec()]);
	}

	#[test]
	fn test_policy_blocks_unlisted_peer() {
		let mut net = Network::new(2, false);
		let allow = AllowList::new([net.id(1)]);
		let identity = net.nodes[1].stack.identity().clone();
		net.nodes[1].stack = OverlayStack::new(
			identity,
			EngineSettings {
				base_servers: vec!["base.example.com".to_string()],
				..EngineSettings::default()
			},
			5582,
			Arc::new(allow),
		);
		net.with_outbox(1, |stack, now, interfaces, out| stack.periodic(now, interfaces, out));
		net.run();

		net.send(0, 1, b"blocked");
		net.run();
		assert!(net.nodes[1].inbound.is_empty());
		assert!(net.nodes[1].stack.peers().is_empty());
	}

	#[test]
	fn test_status_reports_base_and_addresses() {
		let net = Network::new(1, false);
		let status = net.nodes[0].stack.status(net.now);
		assert_eq!(status.base_address, Some(BASE.parse().unwrap()));
		assert_eq!(status.local_addresses, vec![net.nodes[0].udp]);
		assert_eq!(status.peers, 0);
		assert_eq!(status.base_udp_age_ms, None);
		assert_eq!(status.device, net.id(0).to_string());
	}
}
