// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Dialects spoken with the base (rendezvous) server.

use crate::cursor::{put_socket_addr, verify_sender, Reader, PACKED_ADDR_LEN};
use crate::error::{Result, WireError};
use bytes::BufMut;
use loom_overlay_common::{DeviceAddress, Identity, SignatureKind, SIGNATURE_LEN};
use std::net::SocketAddr;

pub const BASE_COOKIE_LEN: usize = 16;
pub type BaseCookie = [u8; BASE_COOKIE_LEN];

pub const P2B_REQUEST_INFO: u8 = 0;
pub const P2B_DATA: u8 = 1;
pub const P2B_INFO: u8 = 2;
pub const P2B_NAT_INIT: u8 = 3;
pub const P2B_USER_AGENT: u8 = 4;
pub const P2B_NAT_OK_CONFIRM: u8 = 5;
pub const P2B_NAT_INIT_TRANSIENT: u8 = 6;

pub const B2P_HELLO: u8 = 0;
pub const B2P_DEVICE_ADDRESSES: u8 = 1;
pub const B2P_DATA: u8 = 2;
pub const B2P_NAT_OK: u8 = 3;
pub const B2P_STATE: u8 = 4;
pub const B2P_REDIRECT: u8 = 5;

/// Upper bound on base UDP addresses carried by a STATE message.
pub const MAX_BASE_UDP_ADDRESSES: usize = 5;

const SIGNED_PREFIX_LEN: usize = 1 + 16 + 32 + BASE_COOKIE_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerToBase {
	RequestInfo { device: DeviceAddress },
	Data { target: DeviceAddress, payload: Vec<u8> },
	Info { addresses: Vec<SocketAddr> },
	NatInit { counter: u64 },
	UserAgent(String),
	NatOkConfirm { counter: u64 },
	NatInitTransient { counter: u64 },
}

/// A decoded peer-to-base message with whatever envelope its kind carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerToBaseEnvelope {
	pub sender: Option<DeviceAddress>,
	pub cookie: Option<BaseCookie>,
	pub message: PeerToBase,
}

impl PeerToBase {
	pub fn kind(&self) -> u8 {
		match self {
			PeerToBase::RequestInfo { .. } => P2B_REQUEST_INFO,
			PeerToBase::Data { .. } => P2B_DATA,
			PeerToBase::Info { .. } => P2B_INFO,
			PeerToBase::NatInit { .. } => P2B_NAT_INIT,
			PeerToBase::UserAgent(_) => P2B_USER_AGENT,
			PeerToBase::NatOkConfirm { .. } => P2B_NAT_OK_CONFIRM,
			PeerToBase::NatInitTransient { .. } => P2B_NAT_INIT_TRANSIENT,
		}
	}

	/// Serializes the message. DATA and USER_AGENT are unsigned; every other
	/// kind is prefixed with our address, key and `cookie`, then signed.
	pub fn encode(&self, identity: &Identity, cookie: &BaseCookie) -> Vec<u8> {
		let kind = self.kind();
		match self {
			PeerToBase::Data { target, payload } => {
				let mut buf = Vec::with_capacity(33 + payload.len());
				buf.put_u8(kind);
				buf.put_slice(identity.address().as_bytes());
				buf.put_slice(target.as_bytes());
				buf.put_slice(payload);
				return buf;
			}
			PeerToBase::UserAgent(agent) => {
				let mut buf = Vec::with_capacity(1 + agent.len());
				buf.put_u8(kind);
				buf.put_slice(agent.as_bytes());
				return buf;
			}
			_ => {}
		}

		let mut buf = Vec::with_capacity(SIGNED_PREFIX_LEN + 64 + SIGNATURE_LEN);
		buf.put_u8(kind);
		buf.put_slice(identity.address().as_bytes());
		buf.put_slice(identity.public_key().as_bytes());
		buf.put_slice(cookie);
		match self {
			PeerToBase::RequestInfo { device } => buf.put_slice(device.as_bytes()),
			PeerToBase::Info { addresses } => {
				for address in addresses {
					put_socket_addr(&mut buf, address);
				}
			}
			PeerToBase::NatInit { counter }
			| PeerToBase::NatOkConfirm { counter }
			| PeerToBase::NatInitTransient { counter } => buf.put_u64(*counter),
			PeerToBase::Data { .. } | PeerToBase::UserAgent(_) => {}
		}
		let signature = identity.sign(SignatureKind::PeerToBase, &buf);
		buf.put_slice(&signature);
		buf
	}

	/// Server-side decode. Signed kinds are verified against their sender.
	pub fn decode(data: &[u8]) -> Result<PeerToBaseEnvelope> {
		let kind = *data.first().ok_or(WireError::Empty)?;
		match kind {
			P2B_DATA => {
				let mut reader = Reader::new(kind, &data[1..]);
				let sender = reader.device_address()?;
				let target = reader.device_address()?;
				Ok(PeerToBaseEnvelope {
					sender: Some(sender),
					cookie: None,
					message: PeerToBase::Data {
						target,
						payload: reader.rest().to_vec(),
					},
				})
			}
			P2B_USER_AGENT => Ok(PeerToBaseEnvelope {
				sender: None,
				cookie: None,
				message: PeerToBase::UserAgent(String::from_utf8_lossy(&data[1..]).into_owned()),
			}),
			P2B_REQUEST_INFO | P2B_INFO | P2B_NAT_INIT | P2B_NAT_OK_CONFIRM
			| P2B_NAT_INIT_TRANSIENT => decode_signed(kind, data),
			_ => Err(WireError::InvalidKind(kind)),
		}
	}
}

fn decode_signed(kind: u8, data: &[u8]) -> Result<PeerToBaseEnvelope> {
	if data.len() < SIGNED_PREFIX_LEN + SIGNATURE_LEN {
		return Err(WireError::PayloadTooShort(kind));
	}
	let signed = &data[..data.len() - SIGNATURE_LEN];
	let signature = &data[data.len() - SIGNATURE_LEN..];

	let mut reader = Reader::new(kind, &signed[1..]);
	let sender = reader.device_address()?;
	let key = reader.public_key()?;
	let cookie = reader.array::<BASE_COOKIE_LEN>()?;
	verify_sender(SignatureKind::PeerToBase, &sender, &key, signed, signature)?;

	let body_len = reader.remaining();
	let message = match kind {
		P2B_REQUEST_INFO => {
			if body_len != 16 {
				return Err(WireError::InvalidLength { kind, len: data.len() });
			}
			PeerToBase::RequestInfo {
				device: reader.device_address()?,
			}
		}
		P2B_INFO => {
			if body_len % PACKED_ADDR_LEN != 0 {
				return Err(WireError::InvalidLength { kind, len: data.len() });
			}
			let mut addresses = Vec::with_capacity(body_len / PACKED_ADDR_LEN);
			while reader.remaining() > 0 {
				addresses.push(reader.socket_addr()?);
			}
			PeerToBase::Info { addresses }
		}
		_ => {
			if body_len != 8 {
				return Err(WireError::InvalidLength { kind, len: data.len() });
			}
			let counter = reader.u64()?;
			match kind {
				P2B_NAT_INIT => PeerToBase::NatInit { counter },
				P2B_NAT_OK_CONFIRM => PeerToBase::NatOkConfirm { counter },
				_ => PeerToBase::NatInitTransient { counter },
			}
		}
	};

	Ok(PeerToBaseEnvelope {
		sender: Some(sender),
		cookie: Some(cookie),
		message,
	})
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseToPeer {
	Hello {
		cookie: BaseCookie,
	},
	DeviceAddresses {
		device: DeviceAddress,
		addresses: Vec<SocketAddr>,
	},
	Data {
		source: DeviceAddress,
		payload: Vec<u8>,
	},
	NatOk,
	State {
		udp_addresses: Vec<SocketAddr>,
		transient_range: Option<(u16, u16)>,
	},
	Redirect {
		address: SocketAddr,
	},
}

impl BaseToPeer {
	pub fn kind(&self) -> u8 {
		match self {
			BaseToPeer::Hello { .. } => B2P_HELLO,
			BaseToPeer::DeviceAddresses { .. } => B2P_DEVICE_ADDRESSES,
			BaseToPeer::Data { .. } => B2P_DATA,
			BaseToPeer::NatOk => B2P_NAT_OK,
			BaseToPeer::State { .. } => B2P_STATE,
			BaseToPeer::Redirect { .. } => B2P_REDIRECT,
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut buf = vec![self.kind()];
		match self {
			BaseToPeer::Hello { cookie } => buf.put_slice(cookie),
			BaseToPeer::DeviceAddresses { device, addresses } => {
				buf.put_slice(device.as_bytes());
				for address in addresses {
					put_socket_addr(&mut buf, address);
				}
			}
			BaseToPeer::Data { source, payload } => {
				buf.put_slice(source.as_bytes());
				buf.put_slice(payload);
			}
			BaseToPeer::NatOk => {}
			BaseToPeer::State {
				udp_addresses,
				transient_range,
			} => {
				for address in udp_addresses.iter().take(MAX_BASE_UDP_ADDRESSES) {
					put_socket_addr(&mut buf, address);
				}
				if let Some((first, last)) = transient_range {
					buf.put_u16(*first);
					buf.put_u16(*last);
				}
			}
			BaseToPeer::Redirect { address } => put_socket_addr(&mut buf, address),
		}
		buf
	}

	pub fn decode(data: &[u8]) -> Result<Self> {
		let kind = *data.first().ok_or(WireError::Empty)?;
		let mut reader = Reader::new(kind, &data[1..]);
		match kind {
			B2P_HELLO => {
				if data.len() != 1 + BASE_COOKIE_LEN {
					return Err(WireError::InvalidLength { kind, len: data.len() });
				}
				Ok(BaseToPeer::Hello {
					cookie: reader.array()?,
				})
			}
			B2P_DEVICE_ADDRESSES => {
				if data.len() <= 17 {
					return Err(WireError::PayloadTooShort(kind));
				}
				let device = reader.device_address()?;
				let mut addresses = Vec::new();
				while reader.remaining() >= PACKED_ADDR_LEN {
					addresses.push(reader.socket_addr()?);
				}
				Ok(BaseToPeer::DeviceAddresses { device, addresses })
			}
			B2P_DATA => {
				if data.len() <= 17 {
					return Err(WireError::PayloadTooShort(kind));
				}
				let source = reader.device_address()?;
				Ok(BaseToPeer::Data {
					source,
					payload: reader.rest().to_vec(),
				})
			}
			B2P_NAT_OK => Ok(BaseToPeer::NatOk),
			B2P_STATE => {
				let mut udp_addresses = Vec::new();
				while reader.remaining() >= PACKED_ADDR_LEN
					&& udp_addresses.len() < MAX_BASE_UDP_ADDRESSES
				{
					udp_addresses.push(reader.socket_addr()?);
				}
				let transient_range = if reader.remaining() >= 4 {
					Some((reader.u16()?, reader.u16()?))
				} else {
					None
				};
				if udp_addresses.is_empty() {
					return Err(WireError::PayloadTooShort(kind));
				}
				Ok(BaseToPeer::State {
					udp_addresses,
					transient_range,
				})
			}
			B2P_REDIRECT => Ok(BaseToPeer::Redirect {
				address: reader.socket_addr()?,
			}),
			_ => Err(WireError::InvalidKind(kind)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn addr(s: &str) -> SocketAddr {
		s.parse().unwrap()
	}

	#[test]
	fn test_signed_messages_verify() {
		let identity = Identity::generate();
		let cookie = [3u8; BASE_COOKIE_LEN];
		let messages = [
			PeerToBase::RequestInfo {
				device: "fc94::9".parse().unwrap(),
			},
			PeerToBase::Info {
				addresses: vec![addr("192.168.1.5:5582"), addr("[2001:db8::1]:5582")],
			},
			PeerToBase::NatInit { counter: 42 },
			PeerToBase::NatOkConfirm { counter: 43 },
			PeerToBase::NatInitTransient { counter: 44 },
		];
		for message in messages {
			let encoded = message.encode(&identity, &cookie);
			let envelope = PeerToBase::decode(&encoded).unwrap();
			assert_eq!(envelope.sender, Some(identity.address()));
			assert_eq!(envelope.cookie, Some(cookie));
			assert_eq!(envelope.message, message);
		}
	}

	#[test]
	fn test_signed_message_tamper_detected() {
		let identity = Identity::generate();
		let mut encoded = PeerToBase::NatInit { counter: 1 }.encode(&identity, &[0u8; 16]);
		let last_body_byte = encoded.len() - SIGNATURE_LEN - 1;
		encoded[last_body_byte] ^= 1;
		assert!(matches!(
			PeerToBase::decode(&encoded),
			Err(WireError::BadSignature)
		));
	}

	#[test]
	fn test_user_agent_and_data_are_unsigned() {
		let identity = Identity::generate();
		let cookie = [9u8; BASE_COOKIE_LEN];

		let agent = PeerToBase::UserAgent("loom-overlay/0.1".to_string());
		let encoded = agent.encode(&identity, &cookie);
		assert_eq!(encoded[0], P2B_USER_AGENT);
		assert_eq!(&encoded[1..], b"loom-overlay/0.1");
		let envelope = PeerToBase::decode(&encoded).unwrap();
		assert_eq!(envelope.cookie, None);

		let target: DeviceAddress = "fc94::77".parse().unwrap();
		let data = PeerToBase::Data {
			target,
			payload: b"relay".to_vec(),
		};
		let encoded = data.encode(&identity, &cookie);
		assert_eq!(encoded.len(), 33 + 5);
		let envelope = PeerToBase::decode(&encoded).unwrap();
		assert_eq!(envelope.sender, Some(identity.address()));
		assert_eq!(envelope.message, data);
	}

	#[test]
	fn test_base_hello_requires_exact_length() {
		let mut data = vec![B2P_HELLO];
		data.extend_from_slice(&[5u8; 16]);
		assert_eq!(
			BaseToPeer::decode(&data).unwrap(),
			BaseToPeer::Hello { cookie: [5u8; 16] }
		);
		data.push(0);
		assert!(matches!(
			BaseToPeer::decode(&data),
			Err(WireError::InvalidLength { kind: 0, len: 18 })
		));
	}

	#[test]
	fn test_device_addresses_ignore_trailing_partial() {
		let message = BaseToPeer::DeviceAddresses {
			device: "fc94::5".parse().unwrap(),
			addresses: vec![addr("1.2.3.4:5582"), addr("[2001:db8::2]:6000")],
		};
		let mut encoded = message.encode();
		assert_eq!(BaseToPeer::decode(&encoded).unwrap(), message);
		encoded.extend_from_slice(&[1, 2, 3]);
		assert_eq!(BaseToPeer::decode(&encoded).unwrap(), message);
	}

	#[test]
	fn test_device_addresses_too_short() {
		let data = vec![B2P_DEVICE_ADDRESSES; 17];
		assert!(matches!(
			BaseToPeer::decode(&data),
			Err(WireError::PayloadTooShort(1))
		));
	}

	#[test]
	fn test_state_with_transient_range() {
		let message = BaseToPeer::State {
			udp_addresses: vec![addr("203.0.113.1:5582"), addr("203.0.113.2:5582")],
			transient_range: Some((5000, 5010)),
		};
		assert_eq!(BaseToPeer::decode(&message.encode()).unwrap(), message);
	}

	#[test]
	fn test_state_caps_addresses() {
		let mut data = vec![B2P_STATE];
		for i in 0..6u16 {
			put_socket_addr(&mut data, &SocketAddr::new([10, 0, 0, 1].into(), 1000 + i));
		}
		match BaseToPeer::decode(&data).unwrap() {
			BaseToPeer::State {
				udp_addresses,
				transient_range,
			} => {
				assert_eq!(udp_addresses.len(), MAX_BASE_UDP_ADDRESSES);
				// The sixth address is read as a range from its first four bytes.
				assert_eq!(transient_range, Some((0, 0)));
			}
			other => panic!("unexpected message {other:?}"),
		}
	}

	#[test]
	fn test_state_without_addresses_is_rejected() {
		assert!(matches!(
			BaseToPeer::decode(&[B2P_STATE, 0x13, 0x88, 0x13, 0x92]),
			Err(WireError::PayloadTooShort(4))
		));
	}

	#[test]
	fn test_redirect_and_nat_ok() {
		let redirect = BaseToPeer::Redirect {
			address: addr("198.51.100.4:443"),
		};
		assert_eq!(BaseToPeer::decode(&redirect.encode()).unwrap(), redirect);
		assert_eq!(BaseToPeer::decode(&[B2P_NAT_OK]).unwrap(), BaseToPeer::NatOk);
		assert!(matches!(
			BaseToPeer::decode(&[B2P_REDIRECT, 1, 2]),
			Err(WireError::PayloadTooShort(5))
		));
	}

	#[test]
	fn test_unknown_kind() {
		assert!(matches!(
			BaseToPeer::decode(&[42]),
			Err(WireError::InvalidKind(42))
		));
		assert!(matches!(BaseToPeer::decode(&[]), Err(WireError::Empty)));
	}
}
