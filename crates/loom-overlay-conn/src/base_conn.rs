// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Framed TCP link to the base server.
//!
//! A single task owns the connection. Each connect bumps a generation
//! counter, and events from readers of earlier connections are dropped so
//! a late close from a replaced link never tears down the current one.

use crate::error::{ConnError, Result};
use loom_overlay_wire::{read_frame, write_frame, WireError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub const BASE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseCommand {
	/// Replace any current connection with one to `host:port`.
	Connect { host: String, port: u16 },
	Send(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseEvent {
	Connected(SocketAddr),
	Message(Vec<u8>),
	Closed,
}

enum LinkEvent {
	Message(Vec<u8>),
	Closed,
}

struct Link {
	writer: OwnedWriteHalf,
	reader: JoinHandle<()>,
}

impl Drop for Link {
	fn drop(&mut self) {
		self.reader.abort();
	}
}

/// Spawns the base connection task. It runs until `shutdown` flips, the
/// command sender is dropped, or the event receiver goes away.
pub fn spawn_base_connection(
	events: mpsc::Sender<BaseEvent>,
	shutdown: watch::Receiver<bool>,
) -> (mpsc::Sender<BaseCommand>, JoinHandle<()>) {
	let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
	let task = tokio::spawn(run(command_rx, events, shutdown));
	(command_tx, task)
}

async fn run(
	mut commands: mpsc::Receiver<BaseCommand>,
	events: mpsc::Sender<BaseEvent>,
	mut shutdown: watch::Receiver<bool>,
) {
	let (link_tx, mut link_rx) = mpsc::channel::<(u64, LinkEvent)>(COMMAND_QUEUE);
	let mut link: Option<Link> = None;
	let mut generation = 0u64;

	loop {
		let event = tokio::select! {
			biased;

			_ = shutdown.changed() => {
				debug!("base connection shutting down");
				break;
			}

			command = commands.recv() => {
				let Some(command) = command else { break };
				match command {
					BaseCommand::Connect { host, port } => {
						link = None;
						generation += 1;
						match connect(&host, port).await {
							Ok(stream) => {
								let peer = stream.peer_addr().ok();
								let (reader, writer) = stream.into_split();
								let reader = tokio::spawn(read_loop(reader, generation, link_tx.clone()));
								link = Some(Link { writer, reader });
								match peer {
									Some(addr) => Some(BaseEvent::Connected(addr)),
									None => {
										link = None;
										Some(BaseEvent::Closed)
									}
								}
							}
							Err(e) => {
								warn!(%host, port, error = %e, "base connection failed");
								Some(BaseEvent::Closed)
							}
						}
					}
					BaseCommand::Send(payload) => match link.as_mut() {
						Some(current) => match write_frame(&mut current.writer, &payload).await {
							Ok(()) => None,
							Err(WireError::FrameTooLarge(len, max)) => {
								warn!(len, max, "base message too large, dropping");
								None
							}
							Err(e) => {
								warn!(error = %e, "base write failed");
								link = None;
								Some(BaseEvent::Closed)
							}
						},
						None => {
							debug!(len = payload.len(), "no base connection, dropping message");
							None
						}
					},
				}
			}

			Some((link_generation, event)) = link_rx.recv() => {
				if link_generation != generation || link.is_none() {
					continue;
				}
				match event {
					LinkEvent::Message(frame) => Some(BaseEvent::Message(frame)),
					LinkEvent::Closed => {
						link = None;
						Some(BaseEvent::Closed)
					}
				}
			}
		};

		if let Some(event) = event {
			if events.send(event).await.is_err() {
				break;
			}
		}
	}
}

#[instrument(skip_all, fields(%host, port))]
async fn connect(host: &str, port: u16) -> Result<TcpStream> {
	let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
		.await
		.map_err(|_| ConnError::Resolve(format!("{host}:{port}")))?
		.collect();
	if addrs.is_empty() {
		return Err(ConnError::Resolve(format!("{host}:{port}")));
	}

	let mut last_error = ConnError::ConnectTimeout;
	for addr in addrs {
		match tokio::time::timeout(BASE_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
			Ok(Ok(stream)) => {
				stream.set_nodelay(true)?;
				info!(%addr, "connected to base");
				return Ok(stream);
			}
			Ok(Err(e)) => {
				debug!(%addr, error = %e, "base address unreachable");
				last_error = ConnError::Io(e);
			}
			Err(_) => {
				debug!(%addr, "base connect timed out");
				last_error = ConnError::ConnectTimeout;
			}
		}
	}
	Err(last_error)
}

async fn read_loop(mut reader: OwnedReadHalf, generation: u64, tx: mpsc::Sender<(u64, LinkEvent)>) {
	loop {
		match read_frame(&mut reader).await {
			Ok(frame) => {
				if tx.send((generation, LinkEvent::Message(frame))).await.is_err() {
					return;
				}
			}
			Err(e) => {
				debug!(generation, error = %e, "base read ended");
				let _ = tx.send((generation, LinkEvent::Closed)).await;
				return;
			}
		}
	}
}
