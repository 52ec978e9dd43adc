// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Transport state machine: base connection upkeep, NAT traversal, path
//! probing and relaying.
//!
//! `NgSocket` never touches a socket. Every entry point receives the current
//! time and an [`Outbox`] and records the datagrams, base messages and
//! verification jobs it wants performed. Security frames received for the
//! upper layer are placed in [`Outbox::frames`].

use crate::outbox::{Outbox, Transmit};
use crate::peers::{PeerHandle, PeerRegistry};
use crate::settings::{split_host_port, EngineSettings, BASE_SERVER_PORT};
use loom_overlay_common::{
	canonical_ip, is_link_local, is_local_network, is_overlay_ip, DeviceAddress, Identity,
};
use loom_overlay_conn::{
	base_reconnect_timeout, candidate_addresses, may_retry, should_fall_back_to_relay,
	should_reestablish_on_send, since, NAT_INIT_TIMEOUT, PERIODIC_INTERVAL, REFRESH_TIMEOUT,
	UDP_BASE_TIMEOUT,
};
use loom_overlay_wire::{
	BaseCookie, BaseToPeer, Beacon, Hello, HelloCookie, PeerMessage, PeerToBase, BASE_COOKIE_LEN,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Failed base connects before rotating through the configured servers.
const BASE_FAILOVER_AFTER: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseConnectionType {
	None,
	Tcp,
	Udp,
}

pub struct NgSocket {
	identity: Arc<Identity>,
	settings: EngineSettings,
	source_port: u16,

	cookie: Option<BaseCookie>,
	base_connection: bool,
	base_connect_retries: u32,
	base_target: Option<(String, u16)>,
	base_address: Option<SocketAddr>,
	base_udp_address: Option<SocketAddr>,
	all_base_udp_addresses: Vec<SocketAddr>,
	transient_range: Option<(u16, u16)>,
	transient_port: Option<u16>,

	nat_init_counter: u64,
	nat_init_confirmed: bool,
	last_nat_init_sent: Option<Instant>,
	last_nat_init_confirmation: Option<Instant>,
	last_base_tcp_action: Option<Instant>,
	last_base_tcp_message: Option<Instant>,
	last_refresh: Option<Instant>,
	last_periodic: Option<Instant>,

	local_addresses: Vec<SocketAddr>,
}

impl NgSocket {
	pub fn new(identity: Arc<Identity>, settings: EngineSettings, source_port: u16) -> Self {
		Self {
			identity,
			settings,
			source_port,
			cookie: None,
			base_connection: false,
			base_connect_retries: 0,
			base_target: None,
			base_address: None,
			base_udp_address: None,
			all_base_udp_addresses: Vec::new(),
			transient_range: None,
			transient_port: None,
			nat_init_counter: 0,
			nat_init_confirmed: true,
			last_nat_init_sent: None,
			last_nat_init_confirmation: None,
			last_base_tcp_action: None,
			last_base_tcp_message: None,
			last_refresh: None,
			last_periodic: None,
			local_addresses: Vec::new(),
		}
	}

	pub fn source_port(&self) -> u16 {
		self.source_port
	}

	pub fn settings(&self) -> &EngineSettings {
		&self.settings
	}

	pub fn local_addresses(&self) -> &[SocketAddr] {
		&self.local_addresses
	}

	/// Address of the connected base server, if any.
	pub fn base_address(&self) -> Option<SocketAddr> {
		self.base_address
	}

	pub fn has_base_session(&self) -> bool {
		self.base_connection && self.cookie.is_some()
	}

	pub fn base_connection_type(&self, now: Instant) -> BaseConnectionType {
		if self.is_base_udp(now) {
			BaseConnectionType::Udp
		} else if self.base_connection && since(now, self.last_base_tcp_message) < UDP_BASE_TIMEOUT {
			BaseConnectionType::Tcp
		} else {
			BaseConnectionType::None
		}
	}

	fn is_base_udp(&self, now: Instant) -> bool {
		self.base_udp_address.is_some() && since(now, self.last_nat_init_confirmation) < UDP_BASE_TIMEOUT
	}

	/// Housekeeping, throttled to [`PERIODIC_INTERVAL`]. `interface_ips` is
	/// the current set of local interface addresses.
	pub fn periodic(
		&mut self,
		peers: &mut PeerRegistry,
		now: Instant,
		interface_ips: &[IpAddr],
		out: &mut Outbox,
	) {
		if since(now, self.last_periodic) < PERIODIC_INTERVAL {
			return;
		}
		self.last_periodic = Some(now);

		if self.reload_local_addresses(interface_ips) {
			info!(addresses = ?self.local_addresses, "local address change detected");
			self.last_refresh = None;
			if since(now, self.last_base_tcp_action) > NAT_INIT_TIMEOUT {
				self.connect_to_base(now, out);
			}
		}

		if since(now, self.last_refresh) > REFRESH_TIMEOUT {
			self.refresh(peers, now, out);
		}

		if !self.nat_init_confirmed && since(now, self.last_nat_init_sent) > NAT_INIT_TIMEOUT {
			self.send_nat_init(now, out);
		}

		if since(now, self.last_base_tcp_action) > base_reconnect_timeout(self.base_connection) {
			self.connect_to_base(now, out);
		}
	}

	/// Returns true when the set changed from a previously known non-empty
	/// set.
	fn reload_local_addresses(&mut self, interface_ips: &[IpAddr]) -> bool {
		let mut addresses: Vec<SocketAddr> = interface_ips
			.iter()
			.map(|ip| canonical_ip(*ip))
			.filter(|ip| !is_overlay_ip(*ip))
			.map(|ip| SocketAddr::new(ip, self.source_port))
			.chain(self.settings.extra_advertised_address)
			.collect();
		addresses.sort();
		addresses.dedup();

		if addresses == self.local_addresses {
			return false;
		}
		let had_addresses = !self.local_addresses.is_empty();
		self.local_addresses = addresses;
		had_addresses
	}

	fn refresh(&mut self, peers: &mut PeerRegistry, now: Instant, out: &mut Outbox) {
		self.last_refresh = Some(now);
		self.send_local_addresses(out);
		self.send_nat_init(now, out);
		self.send_multicast(out);

		for handle in peers.handles() {
			self.periodic_peer(peers, handle, now, out);
		}
	}

	fn periodic_peer(&self, peers: &mut PeerRegistry, handle: PeerHandle, now: Instant, out: &mut Outbox) {
		let peer = peers.peer_mut(handle);
		if !peer.is_active(now) {
			peer.connected = false;
			return;
		}

		if should_fall_back_to_relay(peer.connected, peer.reestablishing, peer.last_reestablish, now) {
			peer.connected = false;
			warn!(peer = %peer.id(), "falling back to relay");
		}

		if may_retry(peer.failed_establishments) {
			self.attempt_reestablish(peers, handle, now, out);
		}
	}

	/// Probes every candidate address of the peer with a fresh cookie. The
	/// first matching reply wins.
	fn attempt_reestablish(&self, peers: &mut PeerRegistry, handle: PeerHandle, now: Instant, out: &mut Outbox) {
		if !self.settings.enable_udp {
			return;
		}

		let candidates = {
			let peer = peers.peer(handle);
			candidate_addresses(
				&peer.target_addresses,
				peer.link_local_address,
				peer.source_addresses(),
				|addr| peers.is_address_allowed(addr),
			)
		};

		let cookie: HelloCookie = rand::random();
		let peer = peers.peer_mut(handle);
		peer.failed_establishments = peer.failed_establishments.saturating_add(1);
		peer.last_reestablish = Some(now);
		peer.reestablishing = true;
		peer.hello_cookie = cookie;

		let id = peer.id();
		let active_target = peer.target_address;
		debug!(peer = %id, ?candidates, attempt = peer.failed_establishments, "reestablishing connection");

		let hello = PeerMessage::encode_hello(&self.identity, &id, &cookie);
		for dest in candidates {
			out.push(Transmit::Udp {
				dest,
				payload: hello.clone(),
			});
			if Some(dest) == active_target {
				out.push(Transmit::Udp {
					dest,
					payload: hello.clone(),
				});
			}
		}
	}

	/// Sends an engine DATA frame to `target`, directly when a path is
	/// confirmed and through the base otherwise.
	#[instrument(skip(self, peers, target, data, now, out), fields(peer = %target, len = data.len()))]
	pub fn send_data_packet(
		&mut self,
		peers: &mut PeerRegistry,
		target: DeviceAddress,
		data: &[u8],
		now: Instant,
		out: &mut Outbox,
	) {
		let Some(handle) = peers.get_or_create(&target) else {
			debug!("refusing to send to peer");
			return;
		};

		let peer = peers.peer(handle);
		match (peer.connected, peer.target_address) {
			(true, Some(dest)) => {
				trace!(%dest, "sending directly");
				out.push(Transmit::Udp {
					dest,
					payload: PeerMessage::encode_data(data),
				});
			}
			_ => {
				if should_reestablish_on_send(
					peer.reestablishing,
					peer.last_reestablish,
					peer.failed_establishments,
					now,
				) {
					self.attempt_reestablish(peers, handle, now, out);
				}

				let message = PeerToBase::Data {
					target,
					payload: data.to_vec(),
				};
				if self.is_base_udp(now) && self.settings.enable_udp_tunneling {
					trace!("relaying over base UDP");
					self.send_to_base_udp(&message, out);
				} else if self.settings.enable_tcp_tunneling {
					trace!("relaying over base TCP");
					self.send_to_base_tcp(&message, out);
				} else {
					debug!("no relay path enabled, dropping packet");
				}
			}
		}

		if !peers.peer(handle).is_active(now) {
			self.send_info_request(target, out);
		}
		peers.peer_mut(handle).last_packet = Some(now);
	}

	pub fn udp_packet_received(
		&mut self,
		peers: &mut PeerRegistry,
		source: SocketAddr,
		data: &[u8],
		now: Instant,
		out: &mut Outbox,
	) {
		if Some(source) == self.base_udp_address {
			match BaseToPeer::decode(data) {
				Ok(message) => self.base_message_received_udp(message, now, out),
				Err(e) => debug!(%source, error = %e, "dropping malformed base UDP message"),
			}
			return;
		}

		if PeerMessage::needs_verification(data) {
			out.push(Transmit::Verify {
				source,
				packet: data.to_vec(),
			});
			return;
		}

		match PeerMessage::decode(data) {
			Ok(message) => self.peer_message_received(peers, source, message, now, out),
			Err(e) => debug!(%source, error = %e, "dropping malformed peer packet"),
		}
	}

	/// Handles a decoded peer message. Hellos must already be verified.
	pub fn peer_message_received(
		&mut self,
		peers: &mut PeerRegistry,
		source: SocketAddr,
		message: PeerMessage,
		now: Instant,
		out: &mut Outbox,
	) {
		match message {
			PeerMessage::Data(payload) => match peers.find_by_source(&source) {
				Some(handle) => out.frame(peers.peer(handle).id(), payload),
				None => debug!(%source, "data packet from unknown source"),
			},
			PeerMessage::Hello(hello) => self.hello_received(peers, source, hello, now, out),
			PeerMessage::HelloReply(hello) => self.hello_reply_received(peers, source, hello, now),
		}
	}

	fn hello_received(
		&mut self,
		peers: &mut PeerRegistry,
		source: SocketAddr,
		hello: Hello,
		now: Instant,
		out: &mut Outbox,
	) {
		if hello.recipient != self.identity.address() {
			debug!(%source, "misdirected hello");
			return;
		}
		if !peers.is_address_allowed(&source) {
			debug!(%source, "hello from disallowed address");
			return;
		}
		let Some(handle) = peers.get_or_create(&hello.sender) else {
			return;
		};
		trace!(%source, peer = %hello.sender, active = peers.peer(handle).is_active(now), "hello");

		peers.add_source_address(handle, source);
		let peer = peers.peer_mut(handle);
		peer.failed_establishments = 0;
		if is_link_local(source.ip()) && peer.link_local_address.is_none() {
			peer.link_local_address = Some(source);
			if peer.is_active(now) {
				self.attempt_reestablish(peers, handle, now, out);
			}
		}

		out.push(Transmit::Udp {
			dest: source,
			payload: PeerMessage::encode_hello_reply(&self.identity, &hello.sender, &hello.cookie),
		});
	}

	fn hello_reply_received(&mut self, peers: &mut PeerRegistry, source: SocketAddr, hello: Hello, now: Instant) {
		if hello.recipient != self.identity.address() {
			debug!(%source, "misdirected hello reply");
			return;
		}
		let Some(handle) = peers.get(&hello.sender) else {
			return;
		};

		let peer = peers.peer(handle);
		if !peer.reestablishing {
			trace!(%source, peer = %hello.sender, "no probe outstanding");
			return;
		}
		if peer.hello_cookie != hello.cookie {
			debug!(%source, peer = %hello.sender, "stale hello cookie");
			return;
		}
		if !peers.is_address_allowed(&source) {
			debug!(%source, "hello reply from disallowed address");
			return;
		}

		let rtt = since(now, peer.last_reestablish);
		let peer = peers.peer_mut(handle);
		let changed = !peer.connected || peer.target_address != Some(source);
		peer.target_address = Some(source);
		peer.connected = true;
		peer.failed_establishments = 0;
		peer.reestablishing = false;
		if changed {
			info!(peer = %hello.sender, target = %source, rtt_ms = rtt.as_millis() as u64, "direct path established");
		}
	}

	pub fn multicast_packet_received(
		&mut self,
		peers: &mut PeerRegistry,
		source: SocketAddr,
		data: &[u8],
		now: Instant,
		out: &mut Outbox,
	) {
		if !is_local_network(source.ip()) {
			return;
		}
		if !self.settings.enable_udp || !self.settings.enable_multicast {
			return;
		}
		let beacon = match Beacon::decode(data) {
			Ok(beacon) => beacon,
			Err(e) => {
				debug!(%source, error = %e, "dropping malformed beacon");
				return;
			}
		};
		if beacon.device == self.identity.address() {
			return;
		}

		let handle = peers.get(&beacon.device);
		trace!(%source, peer = %beacon.device, port = beacon.port, interesting = handle.is_some(), "beacon");
		let Some(handle) = handle else {
			return;
		};

		let address = SocketAddr::new(source.ip(), beacon.port);
		let peer = peers.peer_mut(handle);
		if peer.link_local_address != Some(address) {
			peer.link_local_address = Some(address);
			self.attempt_reestablish(peers, handle, now, out);
		}
	}

	pub fn base_tcp_connected(&mut self, address: SocketAddr) {
		debug!(%address, "base TCP connected");
		self.base_address = Some(address);
	}

	pub fn base_tcp_closed(&mut self, now: Instant) {
		info!("base TCP connection closed");
		self.base_connection = false;
		self.base_address = None;
		self.last_base_tcp_action = Some(now);
	}

	pub fn base_tcp_message(&mut self, peers: &mut PeerRegistry, data: &[u8], now: Instant, out: &mut Outbox) {
		self.last_base_tcp_action = Some(now);
		self.last_base_tcp_message = Some(now);
		self.base_connect_retries = 0;

		let message = match BaseToPeer::decode(data) {
			Ok(message) => message,
			Err(e) => {
				debug!(error = %e, "dropping malformed base message");
				return;
			}
		};

		match message {
			BaseToPeer::Hello { cookie } => {
				info!("TCP connection to base established");
				self.cookie = Some(cookie);
				self.resend_info_requests(peers, now, out);
				self.send_local_addresses(out);
				self.refresh(peers, now, out);
			}
			BaseToPeer::DeviceAddresses { device, addresses } => {
				if !self.settings.enable_udp {
					return;
				}
				if let Some(handle) = peers.get(&device) {
					self.change_target_addresses(peers, handle, addresses, now, out);
				}
			}
			BaseToPeer::Data { source, payload } => out.frame(source, payload),
			BaseToPeer::State {
				udp_addresses,
				transient_range,
			} => {
				if !self.settings.enable_udp {
					return;
				}
				self.base_udp_address = udp_addresses.first().copied();
				self.all_base_udp_addresses = udp_addresses;
				debug!(base_udp = ?self.base_udp_address, "received base UDP addresses");

				if let Some((first, last)) = transient_range {
					if first != 0 && last >= first {
						debug!(first, last, "received base transient range");
						self.transient_range = Some((first, last));
						if self.transient_port.is_none() {
							self.transient_port = Some(first);
						}
					}
				}
			}
			BaseToPeer::Redirect { address } => {
				info!(%address, "redirected to new base server");
				self.base_target = Some((address.ip().to_string(), address.port()));
				self.connect_to_base(now, out);
			}
			BaseToPeer::NatOk => debug!("unexpected NAT_OK over TCP"),
		}
	}

	fn base_message_received_udp(&mut self, message: BaseToPeer, now: Instant, out: &mut Outbox) {
		match message {
			BaseToPeer::NatOk => {
				if self.last_nat_init_confirmation.is_none() {
					info!("UDP connection to base established");
				}
				self.last_nat_init_confirmation = Some(now);
				self.nat_init_confirmed = true;
				self.send_to_base_udp(
					&PeerToBase::NatOkConfirm {
						counter: self.nat_init_counter,
					},
					out,
				);
			}
			BaseToPeer::Data { source, payload } => out.frame(source, payload),
			other => debug!(kind = other.kind(), "unexpected base UDP message"),
		}
	}

	fn change_target_addresses(
		&self,
		peers: &mut PeerRegistry,
		handle: PeerHandle,
		addresses: Vec<SocketAddr>,
		now: Instant,
		out: &mut Outbox,
	) {
		let peer = peers.peer_mut(handle);
		if peer.set_target_addresses(addresses) {
			debug!(peer = %peer.id(), addresses = ?peer.target_addresses, "peer addresses changed");
			peer.failed_establishments = 0;
			self.attempt_reestablish(peers, handle, now, out);
		}
	}

	fn connect_to_base(&mut self, now: Instant, out: &mut Outbox) {
		let target = match &self.settings.override_base_address {
			Some(address) => split_host_port(address),
			None => {
				let servers = &self.settings.base_servers;
				if !servers.is_empty() && (self.base_target.is_none() || self.base_connect_retries > BASE_FAILOVER_AFTER) {
					let index = if self.base_connect_retries > BASE_FAILOVER_AFTER {
						self.base_connect_retries as usize % servers.len()
					} else {
						0
					};
					self.base_target = Some((servers[index].clone(), BASE_SERVER_PORT));
					if self.base_connect_retries > BASE_FAILOVER_AFTER {
						info!(host = %servers[index], "retrying with fallback base address");
					}
				}
				self.base_target.clone()
			}
		};

		self.base_connect_retries += 1;
		self.last_base_tcp_action = Some(now);

		let Some((host, port)) = target else {
			warn!("no base server address available");
			return;
		};

		info!(%host, port, attempt = self.base_connect_retries, "establishing connection to base");
		self.cookie = None;
		self.base_connection = true;
		self.base_address = None;
		out.push(Transmit::BaseConnect { host, port });
		out.push(Transmit::BaseTcp {
			payload: PeerToBase::UserAgent(self.settings.user_agent.clone())
				.encode(&self.identity, &[0; BASE_COOKIE_LEN]),
		});
	}

	fn session_cookie(&self) -> Option<BaseCookie> {
		if self.base_connection {
			self.cookie
		} else {
			None
		}
	}

	fn send_to_base_tcp(&self, message: &PeerToBase, out: &mut Outbox) {
		let Some(cookie) = self.session_cookie() else {
			trace!(kind = message.kind(), "no base session, not sending");
			return;
		};
		out.push(Transmit::BaseTcp {
			payload: message.encode(&self.identity, &cookie),
		});
	}

	/// NAT_INIT and NAT_OK_CONFIRM go to every base UDP address so the base
	/// learns all our external mappings.
	fn send_to_base_udp(&self, message: &PeerToBase, out: &mut Outbox) {
		let Some(cookie) = self.session_cookie() else {
			return;
		};
		let payload = message.encode(&self.identity, &cookie);
		match message {
			PeerToBase::NatInit { .. } | PeerToBase::NatOkConfirm { .. } => {
				for dest in &self.all_base_udp_addresses {
					out.push(Transmit::Udp {
						dest: *dest,
						payload: payload.clone(),
					});
				}
			}
			PeerToBase::NatInitTransient { .. } => {
				let Some(port) = self.transient_port else {
					return;
				};
				for base in &self.all_base_udp_addresses {
					out.push(Transmit::Udp {
						dest: SocketAddr::new(base.ip(), port),
						payload: payload.clone(),
					});
				}
			}
			_ => {
				if let Some(dest) = self.base_udp_address {
					out.push(Transmit::Udp { dest, payload });
				}
			}
		}
	}

	fn send_nat_init(&mut self, now: Instant, out: &mut Outbox) {
		if !self.settings.enable_udp || self.cookie.is_none() {
			return;
		}

		self.last_nat_init_sent = Some(now);
		self.nat_init_confirmed = false;

		let counter = self.nat_init_counter;
		self.nat_init_counter += 1;
		self.send_to_base_udp(&PeerToBase::NatInit { counter }, out);

		if let (Some((first, last)), Some(port)) = (self.transient_range, self.transient_port) {
			self.send_to_base_udp(
				&PeerToBase::NatInitTransient {
					counter: self.nat_init_counter,
				},
				out,
			);
			self.transient_port = Some(if port >= last { first } else { port + 1 });
		}
	}

	fn send_local_addresses(&self, out: &mut Outbox) {
		let addresses = if self.settings.enable_udp {
			self.local_addresses.clone()
		} else {
			Vec::new()
		};
		self.send_to_base_tcp(&PeerToBase::Info { addresses }, out);
	}

	fn send_info_request(&self, device: DeviceAddress, out: &mut Outbox) {
		trace!(peer = %device, "requesting peer info");
		self.send_to_base_tcp(&PeerToBase::RequestInfo { device }, out);
	}

	fn resend_info_requests(&self, peers: &PeerRegistry, now: Instant, out: &mut Outbox) {
		for handle in peers.handles() {
			let peer = peers.peer(handle);
			if peer.is_active(now) {
				self.send_info_request(peer.id(), out);
			}
		}
	}

	fn send_multicast(&self, out: &mut Outbox) {
		if !self.settings.enable_udp || !self.settings.enable_multicast {
			return;
		}
		let beacon = Beacon {
			port: self.source_port,
			device: self.identity.address(),
		};
		out.push(Transmit::Multicast {
			payload: beacon.encode(),
		});
	}

	/// Time since the last NAT_OK, for status reporting.
	pub fn base_udp_age(&self, now: Instant) -> Option<Duration> {
		self.last_nat_init_confirmation
			.map(|at| now.saturating_duration_since(at))
	}
}
