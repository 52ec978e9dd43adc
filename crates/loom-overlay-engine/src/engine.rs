// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{EngineError, Result};
use crate::outbox::{Outbox, Transmit};
use crate::policy::{AllowAll, PeerPolicy};
use crate::settings::EngineSettings;
use crate::stack::OverlayStack;
use crate::status::{EngineStatus, PeerStatus};
use loom_overlay_common::{DeviceAddress, Identity};
use loom_overlay_conn::{
	bind_multicast_v4, bind_multicast_v6, bind_unicast, interface_addresses, spawn_base_connection,
	BaseCommand, BaseEvent, MulticastSocket, UnicastSocket, PERIODIC_INTERVAL,
};
use loom_overlay_wire::PeerMessage;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

/// Largest datagram read from the UDP sockets.
const MAX_DATAGRAM: usize = 65536;
const EVENT_QUEUE: usize = 1024;
const COMMAND_QUEUE: usize = 256;
const VERIFY_QUEUE: usize = 256;

pub struct OverlayEngineConfig {
	pub identity: Arc<Identity>,
	pub settings: EngineSettings,
	pub policy: Arc<dyn PeerPolicy>,
}

impl OverlayEngineConfig {
	pub fn new(identity: Arc<Identity>, settings: EngineSettings) -> Self {
		Self {
			identity,
			settings,
			policy: Arc::new(AllowAll),
		}
	}
}

/// Plaintext received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
	pub source: DeviceAddress,
	pub payload: Vec<u8>,
}

enum Command {
	Send {
		target: DeviceAddress,
		payload: Vec<u8>,
	},
	Latency {
		target: DeviceAddress,
		reply: oneshot::Sender<Option<Duration>>,
	},
	Status(oneshot::Sender<EngineStatus>),
	PeerStatus {
		target: DeviceAddress,
		reply: oneshot::Sender<Option<PeerStatus>>,
	},
}

enum Event {
	Udp(SocketAddr, Vec<u8>),
	Multicast(SocketAddr, Vec<u8>),
}

struct VerifyJob {
	source: SocketAddr,
	packet: Vec<u8>,
}

/// Sockets bound by [`OverlayEngine::new`] and consumed by `start`.
struct Bound {
	stack: OverlayStack,
	unicast: Arc<UnicastSocket>,
	multicast: Vec<Arc<MulticastSocket>>,
	commands: mpsc::Receiver<Command>,
}

/// Owns the overlay stack on a single task and feeds it from the sockets,
/// the base connection and the signature verification worker.
pub struct OverlayEngine {
	identity: Arc<Identity>,
	source_port: u16,
	commands: mpsc::Sender<Command>,
	bound: Mutex<Option<Bound>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
	running: AtomicBool,
}

impl OverlayEngine {
	#[instrument(skip(config), fields(device = %config.identity.address()))]
	pub async fn new(config: OverlayEngineConfig) -> Result<Self> {
		if !config.settings.has_base() {
			return Err(EngineError::NoBaseServers);
		}

		let unicast = bind_unicast(config.settings.override_source_port).await?;
		let source_port = unicast.port();

		let mut multicast = Vec::new();
		if config.settings.enable_udp && config.settings.enable_multicast {
			for bind in [bind_multicast_v4, bind_multicast_v6] {
				match bind() {
					Ok(socket) => multicast.push(Arc::new(socket)),
					Err(e) => warn!(error = %e, "failed to join multicast group"),
				}
			}
		}

		let stack = OverlayStack::new(
			config.identity.clone(),
			config.settings,
			source_port,
			config.policy,
		);
		let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		info!(source_port, multicast = multicast.len(), "created overlay engine");

		Ok(Self {
			identity: config.identity,
			source_port,
			commands: command_tx,
			bound: Mutex::new(Some(Bound {
				stack,
				unicast: Arc::new(unicast),
				multicast,
				commands: command_rx,
			})),
			tasks: Mutex::new(Vec::new()),
			shutdown_tx,
			shutdown_rx,
			running: AtomicBool::new(false),
		})
	}

	pub fn address(&self) -> DeviceAddress {
		self.identity.address()
	}

	pub fn source_port(&self) -> u16 {
		self.source_port
	}

	/// Spawns the engine tasks. Received payloads are sent to `deliveries`.
	#[instrument(skip(self, deliveries))]
	pub fn start(&self, deliveries: mpsc::Sender<Delivery>) -> Result<()> {
		if self.running.swap(true, Ordering::SeqCst) {
			return Err(EngineError::AlreadyRunning);
		}
		let bound = self
			.bound
			.lock()
			.ok()
			.and_then(|mut bound| bound.take())
			.ok_or(EngineError::AlreadyRunning)?;

		info!("starting overlay engine");

		let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
		let (base_event_tx, base_event_rx) = mpsc::channel(EVENT_QUEUE);
		let (base_tx, base_task) = spawn_base_connection(base_event_tx, self.shutdown_rx.clone());
		let (verify_tx, verify_rx) = mpsc::channel(VERIFY_QUEUE);
		let (verified_tx, verified_rx) = mpsc::channel(VERIFY_QUEUE);

		std::thread::Builder::new()
			.name("overlay-verify".to_string())
			.spawn(move || verify_worker(verify_rx, verified_tx))?;

		let mut tasks = vec![base_task];
		tasks.push(tokio::spawn(recv_loop(
			DatagramSocket::Unicast(bound.unicast.clone()),
			event_tx.clone(),
			self.shutdown_rx.clone(),
		)));
		for socket in &bound.multicast {
			tasks.push(tokio::spawn(recv_loop(
				DatagramSocket::Multicast(socket.clone()),
				event_tx.clone(),
				self.shutdown_rx.clone(),
			)));
		}
		drop(event_tx);

		let actor = Actor {
			stack: bound.stack,
			unicast: bound.unicast,
			multicast: bound.multicast,
			base_tx,
			verify_tx,
			deliveries,
		};
		tasks.push(tokio::spawn(actor.run(
			self.shutdown_rx.clone(),
			bound.commands,
			event_rx,
			base_event_rx,
			verified_rx,
		)));

		if let Ok(mut slot) = self.tasks.lock() {
			slot.extend(tasks);
		}
		Ok(())
	}

	async fn request<T>(&self, command: Command, reply: oneshot::Receiver<T>) -> Result<T> {
		if !self.is_running() {
			return Err(EngineError::NotRunning);
		}
		self.commands
			.send(command)
			.await
			.map_err(|_| EngineError::NotRunning)?;
		reply.await.map_err(|_| EngineError::NotRunning)
	}

	/// Queues `payload` for `target`. Delivery is best effort.
	pub async fn send(&self, target: DeviceAddress, payload: Vec<u8>) -> Result<()> {
		if !self.is_running() {
			return Err(EngineError::NotRunning);
		}
		self.commands
			.send(Command::Send { target, payload })
			.await
			.map_err(|_| EngineError::NotRunning)
	}

	/// Sends a heartbeat to `target` and returns the last fresh round trip.
	pub async fn latency(&self, target: DeviceAddress) -> Result<Option<Duration>> {
		let (reply, rx) = oneshot::channel();
		self.request(Command::Latency { target, reply }, rx).await
	}

	pub async fn status(&self) -> Result<EngineStatus> {
		let (reply, rx) = oneshot::channel();
		self.request(Command::Status(reply), rx).await
	}

	pub async fn peer_status(&self, target: DeviceAddress) -> Result<Option<PeerStatus>> {
		let (reply, rx) = oneshot::channel();
		self.request(Command::PeerStatus { target, reply }, rx).await
	}

	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		info!("shutting down overlay engine");
		let _ = self.shutdown_tx.send(true);
		self.running.store(false, Ordering::SeqCst);

		let tasks = match self.tasks.lock() {
			Ok(mut tasks) => std::mem::take(&mut *tasks),
			Err(_) => Vec::new(),
		};
		for task in tasks {
			if let Err(e) = task.await {
				if !e.is_cancelled() {
					warn!(error = %e, "engine task failed");
				}
			}
		}
	}

	pub async fn wait(&self) {
		let mut rx = self.shutdown_rx.clone();
		while !*rx.borrow() {
			if rx.changed().await.is_err() {
				break;
			}
		}
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}
}

enum DatagramSocket {
	Unicast(Arc<UnicastSocket>),
	Multicast(Arc<MulticastSocket>),
}

impl DatagramSocket {
	async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
		match self {
			DatagramSocket::Unicast(socket) => socket.recv_from(buf).await,
			DatagramSocket::Multicast(socket) => socket.recv_from(buf).await,
		}
	}

	fn event(&self, source: SocketAddr, data: Vec<u8>) -> Event {
		match self {
			DatagramSocket::Unicast(_) => Event::Udp(source, data),
			DatagramSocket::Multicast(_) => Event::Multicast(source, data),
		}
	}
}

async fn recv_loop(
	socket: DatagramSocket,
	events: mpsc::Sender<Event>,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	let mut buf = vec![0u8; MAX_DATAGRAM];
	loop {
		tokio::select! {
			biased;

			changed = shutdown_rx.changed() => {
				if changed.is_err() || *shutdown_rx.borrow() {
					debug!("receive loop shutting down");
					break;
				}
			}

			result = socket.recv_from(&mut buf) => match result {
				Ok((len, source)) => {
					if events.send(socket.event(source, buf[..len].to_vec())).await.is_err() {
						break;
					}
				}
				Err(e) => debug!(error = %e, "udp receive failed"),
			}
		}
	}
}

/// Checks hello signatures off the event loop.
fn verify_worker(mut jobs: mpsc::Receiver<VerifyJob>, verified: mpsc::Sender<(SocketAddr, PeerMessage)>) {
	while let Some(job) = jobs.blocking_recv() {
		match PeerMessage::decode(&job.packet) {
			Ok(message) => {
				if verified.blocking_send((job.source, message)).is_err() {
					break;
				}
			}
			Err(e) => debug!(source = %job.source, error = %e, "dropping unverifiable hello"),
		}
	}
	debug!("verification worker stopped");
}

struct Actor {
	stack: OverlayStack,
	unicast: Arc<UnicastSocket>,
	multicast: Vec<Arc<MulticastSocket>>,
	base_tx: mpsc::Sender<BaseCommand>,
	verify_tx: mpsc::Sender<VerifyJob>,
	deliveries: mpsc::Sender<Delivery>,
}

impl Actor {
	async fn run(
		mut self,
		mut shutdown_rx: watch::Receiver<bool>,
		mut commands: mpsc::Receiver<Command>,
		mut events: mpsc::Receiver<Event>,
		mut base_events: mpsc::Receiver<BaseEvent>,
		mut verified: mpsc::Receiver<(SocketAddr, PeerMessage)>,
	) {
		let mut ticker = tokio::time::interval(PERIODIC_INTERVAL);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			let mut out = Outbox::new();
			tokio::select! {
				biased;

				changed = shutdown_rx.changed() => {
					if changed.is_err() || *shutdown_rx.borrow() {
						info!("overlay engine loop shutting down");
						break;
					}
				}

				_ = ticker.tick() => {
					let interfaces = interface_addresses();
					self.stack.periodic(Instant::now(), &interfaces, &mut out);
				}

				Some(event) = base_events.recv() => {
					let now = Instant::now();
					match event {
						BaseEvent::Connected(address) => self.stack.base_tcp_connected(address),
						BaseEvent::Message(data) => self.stack.base_tcp_message(&data, now, &mut out),
						BaseEvent::Closed => self.stack.base_tcp_closed(now),
					}
				}

				Some((source, message)) = verified.recv() => {
					self.stack.verified_packet_received(source, message, Instant::now(), &mut out);
				}

				Some(event) = events.recv() => {
					let now = Instant::now();
					match event {
						Event::Udp(source, data) => self.stack.udp_packet_received(source, &data, now, &mut out),
						Event::Multicast(source, data) => self.stack.multicast_packet_received(source, &data, now, &mut out),
					}
				}

				command = commands.recv() => {
					let Some(command) = command else { break };
					self.handle_command(command, &mut out);
				}
			}

			self.flush(out).await;
		}
	}

	fn handle_command(&mut self, command: Command, out: &mut Outbox) {
		let now = Instant::now();
		match command {
			Command::Send { target, payload } => self.stack.send(target, &payload, now, out),
			Command::Latency { target, reply } => {
				let _ = reply.send(self.stack.latency(target, now, out));
			}
			Command::Status(reply) => {
				let _ = reply.send(self.stack.status(now));
			}
			Command::PeerStatus { target, reply } => {
				let _ = reply.send(self.stack.peer_status(&target, now));
			}
		}
	}

	async fn flush(&mut self, mut out: Outbox) {
		for transmit in out.take_transmits() {
			match transmit {
				Transmit::Udp { dest, payload } => {
					trace!(%dest, len = payload.len(), "udp send");
					if let Err(e) = self.unicast.send_to(&payload, dest).await {
						debug!(%dest, error = %e, "udp send failed");
					}
				}
				Transmit::Multicast { payload } => {
					for socket in &self.multicast {
						if let Err(e) = socket.send(&payload).await {
							debug!(group = %socket.group(), error = %e, "multicast send failed");
						}
					}
				}
				Transmit::BaseConnect { host, port } => {
					self.to_base(BaseCommand::Connect { host, port });
				}
				Transmit::BaseTcp { payload } => self.to_base(BaseCommand::Send(payload)),
				Transmit::Verify { source, packet } => {
					if self.verify_tx.try_send(VerifyJob { source, packet }).is_err() {
						warn!(%source, "worker queue full, dropping hello");
					}
				}
			}
		}

		for (source, payload) in out.take_inbound() {
			match self.deliveries.try_send(Delivery { source, payload }) {
				Ok(()) => {}
				Err(TrySendError::Full(_)) => warn!(%source, "delivery queue full, dropping packet"),
				Err(TrySendError::Closed(_)) => trace!(%source, "delivery receiver dropped"),
			}
		}
	}

	fn to_base(&self, command: BaseCommand) {
		match self.base_tx.try_send(command) {
			Ok(()) => {}
			Err(TrySendError::Full(_)) => warn!("base command queue full, dropping message"),
			Err(TrySendError::Closed(_)) => warn!("base connection task stopped"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_overlay_wire::{read_frame, write_frame, BaseToPeer, PeerToBase};
	use std::collections::HashMap;
	use tokio::net::TcpListener;

	type Sessions = Arc<tokio::sync::Mutex<HashMap<DeviceAddress, mpsc::Sender<Vec<u8>>>>>;

	/// Minimal base server: greets every connection and relays DATA between
	/// devices that have sent a signed message.
	async fn spawn_base() -> SocketAddr {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let sessions: Sessions = Arc::default();
		tokio::spawn(async move {
			while let Ok((stream, _)) = listener.accept().await {
				tokio::spawn(serve_device(stream, sessions.clone()));
			}
		});
		addr
	}

	async fn serve_device(stream: tokio::net::TcpStream, sessions: Sessions) {
		let (mut reader, mut writer) = stream.into_split();
		let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
		tokio::spawn(async move {
			while let Some(frame) = rx.recv().await {
				if write_frame(&mut writer, &frame).await.is_err() {
					break;
				}
			}
		});
		let _ = tx.send(BaseToPeer::Hello { cookie: [1; 16] }.encode()).await;

		while let Ok(frame) = read_frame(&mut reader).await {
			let Ok(envelope) = PeerToBase::decode(&frame) else {
				continue;
			};
			let Some(sender) = envelope.sender else {
				continue;
			};
			let target = {
				let mut sessions = sessions.lock().await;
				sessions.insert(sender, tx.clone());
				match &envelope.message {
					PeerToBase::Data { target, .. } => sessions.get(target).cloned(),
					_ => None,
				}
			};
			if let (Some(peer), PeerToBase::Data { payload, .. }) = (target, envelope.message) {
				let _ = peer
					.send(BaseToPeer::Data { source: sender, payload }.encode())
					.await;
			}
		}
	}

	fn settings(base: SocketAddr) -> EngineSettings {
		EngineSettings {
			override_base_address: Some(base.to_string()),
			enable_udp: false,
			enable_multicast: false,
			..EngineSettings::default()
		}
	}

	async fn started(base: SocketAddr) -> (OverlayEngine, mpsc::Receiver<Delivery>) {
		let identity = Arc::new(Identity::generate());
		let engine = OverlayEngine::new(OverlayEngineConfig::new(identity, settings(base)))
			.await
			.unwrap();
		let (tx, rx) = mpsc::channel(16);
		engine.start(tx).unwrap();
		(engine, rx)
	}

	async fn wait_for_base(engine: &OverlayEngine) {
		for _ in 0..100 {
			let status = engine.status().await.unwrap();
			if status.base_connection != crate::ngsocket::BaseConnectionType::None
				&& status.base_address.is_some()
			{
				return;
			}
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
		panic!("engine never reached the base");
	}

	#[test]
	fn test_new_requires_base_server() {
		let identity = Arc::new(Identity::generate());
		let result = tokio_test::block_on(OverlayEngine::new(OverlayEngineConfig::new(
			identity,
			EngineSettings::default(),
		)));
		assert!(matches!(result, Err(EngineError::NoBaseServers)));
	}

	#[tokio::test]
	async fn test_start_twice_fails() {
		let base = spawn_base().await;
		let (engine, _rx) = started(base).await;
		let (tx, _rx2) = mpsc::channel(1);
		assert!(matches!(engine.start(tx), Err(EngineError::AlreadyRunning)));
		assert!(engine.is_running());

		engine.shutdown().await;
		assert!(!engine.is_running());
		assert!(matches!(engine.status().await, Err(EngineError::NotRunning)));
		assert!(matches!(
			engine.send(engine.address(), b"x".to_vec()).await,
			Err(EngineError::NotRunning)
		));
		engine.wait().await;
	}

	#[tokio::test]
	async fn test_flush_drops_when_queues_full() {
		let identity = Arc::new(Identity::generate());
		let unicast = Arc::new(bind_unicast(None).await.unwrap());
		let stack = OverlayStack::new(
			identity.clone(),
			EngineSettings::default(),
			unicast.port(),
			Arc::new(AllowAll),
		);
		let (base_tx, mut base_rx) = mpsc::channel(1);
		let (verify_tx, _verify_rx) = mpsc::channel(1);
		let (delivery_tx, mut delivery_rx) = mpsc::channel(1);
		let mut actor = Actor {
			stack,
			unicast,
			multicast: Vec::new(),
			base_tx,
			verify_tx,
			deliveries: delivery_tx,
		};

		let source = Identity::generate().address();
		let mut out = Outbox::new();
		out.push(Transmit::BaseTcp { payload: b"first".to_vec() });
		out.push(Transmit::BaseTcp { payload: b"second".to_vec() });
		out.deliver(source, b"one".to_vec());
		out.deliver(source, b"two".to_vec());

		tokio::time::timeout(Duration::from_secs(1), actor.flush(out))
			.await
			.expect("flush blocked on a full queue");

		assert_eq!(base_rx.try_recv().unwrap(), BaseCommand::Send(b"first".to_vec()));
		assert!(base_rx.try_recv().is_err());
		let delivery = delivery_rx.try_recv().unwrap();
		assert_eq!(delivery.payload, b"one");
		assert!(delivery_rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn test_commands_before_start_fail() {
		let base = spawn_base().await;
		let identity = Arc::new(Identity::generate());
		let engine = OverlayEngine::new(OverlayEngineConfig::new(identity, settings(base)))
			.await
			.unwrap();
		assert!(matches!(engine.status().await, Err(EngineError::NotRunning)));
	}

	#[tokio::test]
	async fn test_engines_exchange_through_base() {
		let base = spawn_base().await;
		let (a, _a_rx) = started(base).await;
		let (b, mut b_rx) = started(base).await;
		wait_for_base(&a).await;
		wait_for_base(&b).await;

		let mut delivery = None;
		for _ in 0..10 {
			a.send(b.address(), b"ping".to_vec()).await.unwrap();
			if let Ok(received) = tokio::time::timeout(Duration::from_secs(1), b_rx.recv()).await {
				delivery = received;
				break;
			}
		}
		let delivery = delivery.expect("ping was not delivered");
		assert_eq!(delivery.source, a.address());
		assert_eq!(delivery.payload, b"ping".to_vec());

		let peer = a.peer_status(b.address()).await.unwrap().unwrap();
		assert!(peer.negotiated);
		assert!(!peer.connected);

		let mut latency = None;
		for _ in 0..50 {
			latency = a.latency(b.address()).await.unwrap();
			if latency.is_some() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
		assert!(latency.is_some());

		a.shutdown().await;
		b.shutdown().await;
	}
}
