// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! UDP sockets owned by the engine: one dual-stack unicast socket and the
//! two link-local multicast listeners.

use crate::error::{ConnError, Result};
use loom_overlay_common::{canonical_addr, to_ipv6};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::Range;
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument};

pub const DEFAULT_SOURCE_PORT: u16 = 5582;
pub const SOURCE_PORT_LIMIT: u16 = 7000;
pub const MULTICAST_PORT: u16 = 5581;

pub const MULTICAST_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 3, 252, 148);
pub const MULTICAST_GROUP_V6: Ipv6Addr =
	Ipv6Addr::new(0xff02, 0x88bb, 0x31e4, 0x95f7, 0x2b87, 0x6b52, 0xe112, 0x19ac);

pub fn multicast_group_addrs() -> [SocketAddr; 2] {
	[
		SocketAddr::new(IpAddr::V4(MULTICAST_GROUP_V4), MULTICAST_PORT),
		SocketAddr::new(IpAddr::V6(MULTICAST_GROUP_V6), MULTICAST_PORT),
	]
}

/// Unicast socket. Prefers a dual-stack IPv6 socket and falls back to IPv4
/// when the host has no IPv6 support.
#[derive(Debug)]
pub struct UnicastSocket {
	socket: UdpSocket,
	port: u16,
	dual_stack: bool,
}

impl UnicastSocket {
	pub fn port(&self) -> u16 {
		self.port
	}

	pub async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<usize> {
		let dest = if self.dual_stack {
			SocketAddr::new(IpAddr::V6(to_ipv6(dest.ip())), dest.port())
		} else {
			dest
		};
		self.socket.send_to(payload, dest).await
	}

	/// Source addresses come back with v4-mapped IPs collapsed to IPv4.
	pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		let (len, from) = self.socket.recv_from(buf).await?;
		Ok((len, canonical_addr(from)))
	}
}

/// Binds `override_port` exactly, or probes upward from
/// [`DEFAULT_SOURCE_PORT`] until a port is free.
#[instrument]
pub async fn bind_unicast(override_port: Option<u16>) -> Result<UnicastSocket> {
	let socket = match override_port {
		Some(port) => bind_unicast_port(port).map_err(|source| ConnError::Bind { port, source })?,
		None => probe_ports(DEFAULT_SOURCE_PORT..SOURCE_PORT_LIMIT, bind_unicast_port)?,
	};
	info!(port = socket.port, dual_stack = socket.dual_stack, "bound UDP socket");
	Ok(socket)
}

fn probe_ports<T>(range: Range<u16>, mut bind: impl FnMut(u16) -> io::Result<T>) -> Result<T> {
	let (start, end) = (range.start, range.end);
	for port in range {
		match bind(port) {
			Ok(bound) => return Ok(bound),
			Err(e) => debug!(port, error = %e, "UDP port unavailable"),
		}
	}
	Err(ConnError::PortRangeExhausted { start, end })
}

fn bind_unicast_port(port: u16) -> io::Result<UnicastSocket> {
	let (std_socket, dual_stack) = match bind_dual_stack(port) {
		Ok(socket) => (socket, true),
		Err(e) if e.kind() == io::ErrorKind::AddrInUse => return Err(e),
		Err(e) => {
			debug!(error = %e, "dual-stack bind failed, using IPv4 only");
			(bind_v4(port)?, false)
		}
	};
	let port = std_socket.local_addr()?.port();
	Ok(UnicastSocket {
		socket: UdpSocket::from_std(std_socket)?,
		port,
		dual_stack,
	})
}

fn bind_dual_stack(port: u16) -> io::Result<std::net::UdpSocket> {
	let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
	socket.set_only_v6(false)?;
	socket.set_nonblocking(true)?;
	let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
	socket.bind(&addr.into())?;
	Ok(socket.into())
}

fn bind_v4(port: u16) -> io::Result<std::net::UdpSocket> {
	let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
	socket.set_nonblocking(true)?;
	let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
	socket.bind(&addr.into())?;
	Ok(socket.into())
}

/// Listener joined to one of the beacon groups.
#[derive(Debug)]
pub struct MulticastSocket {
	socket: UdpSocket,
	group: SocketAddr,
}

impl MulticastSocket {
	pub fn group(&self) -> SocketAddr {
		self.group
	}

	pub async fn send(&self, payload: &[u8]) -> io::Result<usize> {
		self.socket.send_to(payload, self.group).await
	}

	pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		let (len, from) = self.socket.recv_from(buf).await?;
		Ok((len, canonical_addr(from)))
	}
}

pub fn bind_multicast_v4() -> io::Result<MulticastSocket> {
	let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
	socket.set_reuse_address(true)?;
	#[cfg(any(target_os = "linux", target_os = "macos"))]
	socket.set_reuse_port(true)?;
	socket.set_nonblocking(true)?;
	let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), MULTICAST_PORT);
	socket.bind(&bind_addr.into())?;
	socket.join_multicast_v4(&MULTICAST_GROUP_V4, &Ipv4Addr::UNSPECIFIED)?;
	Ok(MulticastSocket {
		socket: UdpSocket::from_std(socket.into())?,
		group: SocketAddr::new(IpAddr::V4(MULTICAST_GROUP_V4), MULTICAST_PORT),
	})
}

pub fn bind_multicast_v6() -> io::Result<MulticastSocket> {
	let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
	socket.set_only_v6(true)?;
	socket.set_reuse_address(true)?;
	#[cfg(any(target_os = "linux", target_os = "macos"))]
	socket.set_reuse_port(true)?;
	socket.set_nonblocking(true)?;
	let bind_addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), MULTICAST_PORT);
	socket.bind(&bind_addr.into())?;
	socket.join_multicast_v6(&MULTICAST_GROUP_V6, 0)?;
	Ok(MulticastSocket {
		socket: UdpSocket::from_std(socket.into())?,
		group: SocketAddr::new(IpAddr::V6(MULTICAST_GROUP_V6), MULTICAST_PORT),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_probe_ports_skips_busy() {
		let bound = probe_ports(5582..5590, |port| {
			if port < 5585 {
				Err(io::Error::from(io::ErrorKind::AddrInUse))
			} else {
				Ok(port)
			}
		})
		.unwrap();
		assert_eq!(bound, 5585);
	}

	#[test]
	fn test_probe_ports_exhausted() {
		let result = probe_ports(5582..5584, |_| -> io::Result<u16> {
			Err(io::Error::from(io::ErrorKind::AddrInUse))
		});
		assert!(matches!(
			result,
			Err(ConnError::PortRangeExhausted {
				start: 5582,
				end: 5584
			})
		));
	}

	#[test]
	fn test_multicast_groups() {
		let [v4, v6] = multicast_group_addrs();
		assert_eq!(v4.to_string(), "224.3.252.148:5581");
		assert_eq!(v6.port(), MULTICAST_PORT);
		assert!(MULTICAST_GROUP_V6.is_multicast());
	}

	#[tokio::test]
	async fn test_unicast_receives_canonical_v4_source() {
		let socket = bind_unicast(Some(0)).await.unwrap();
		assert_ne!(socket.port(), 0);

		let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let dest: SocketAddr = format!("127.0.0.1:{}", socket.port()).parse().unwrap();
		client.send_to(b"probe", dest).await.unwrap();

		let mut buf = [0u8; 64];
		let (len, from) = socket.recv_from(&mut buf).await.unwrap();
		assert_eq!(&buf[..len], b"probe");
		assert_eq!(from, client.local_addr().unwrap());

		socket.send_to(b"reply", from).await.unwrap();
		let (len, _) = client.recv_from(&mut buf).await.unwrap();
		assert_eq!(&buf[..len], b"reply");
	}

	#[tokio::test]
	async fn test_override_port_conflict_is_reported() {
		let first = bind_unicast(Some(0)).await.unwrap();
		let result = bind_unicast(Some(first.port())).await;
		assert!(matches!(result, Err(ConnError::Bind { .. })));
	}
}
