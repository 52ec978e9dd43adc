// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Peer-to-peer dialect spoken directly between devices over UDP.

use crate::cursor::{verify_sender, Reader};
use crate::error::{Result, WireError};
use bytes::BufMut;
use loom_overlay_common::{DeviceAddress, Identity, SignatureKind, SIGNATURE_LEN};

pub const P2P_HELLO: u8 = 0;
pub const P2P_HELLO_REPLY: u8 = 1;
pub const P2P_DATA: u8 = 2;

pub const HELLO_COOKIE_LEN: usize = 16;
pub const HELLO_LEN: usize = 1 + 16 + 32 + 16 + HELLO_COOKIE_LEN + SIGNATURE_LEN;
const HELLO_SIGNED_LEN: usize = HELLO_LEN - SIGNATURE_LEN;

pub type HelloCookie = [u8; HELLO_COOKIE_LEN];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
	pub sender: DeviceAddress,
	pub recipient: DeviceAddress,
	pub cookie: HelloCookie,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
	Hello(Hello),
	HelloReply(Hello),
	Data(Vec<u8>),
}

impl PeerMessage {
	pub fn kind(&self) -> u8 {
		match self {
			PeerMessage::Hello(_) => P2P_HELLO,
			PeerMessage::HelloReply(_) => P2P_HELLO_REPLY,
			PeerMessage::Data(_) => P2P_DATA,
		}
	}

	/// Hellos carry a signature and are verified off the receive path.
	pub fn needs_verification(data: &[u8]) -> bool {
		matches!(data.first(), Some(&P2P_HELLO) | Some(&P2P_HELLO_REPLY))
	}

	pub fn encode_hello(identity: &Identity, recipient: &DeviceAddress, cookie: &HelloCookie) -> Vec<u8> {
		encode_hello_kind(P2P_HELLO, identity, recipient, cookie)
	}

	pub fn encode_hello_reply(
		identity: &Identity,
		recipient: &DeviceAddress,
		cookie: &HelloCookie,
	) -> Vec<u8> {
		encode_hello_kind(P2P_HELLO_REPLY, identity, recipient, cookie)
	}

	pub fn encode_data(payload: &[u8]) -> Vec<u8> {
		let mut buf = Vec::with_capacity(1 + payload.len());
		buf.put_u8(P2P_DATA);
		buf.put_slice(payload);
		buf
	}

	/// Decodes and, for hellos, verifies the sender binding and signature.
	pub fn decode(data: &[u8]) -> Result<Self> {
		let kind = *data.first().ok_or(WireError::Empty)?;
		match kind {
			P2P_HELLO | P2P_HELLO_REPLY => {
				if data.len() != HELLO_LEN {
					return Err(WireError::InvalidLength {
						kind,
						len: data.len(),
					});
				}
				let mut reader = Reader::new(kind, &data[1..]);
				let sender = reader.device_address()?;
				let key = reader.public_key()?;
				let recipient = reader.device_address()?;
				let cookie = reader.array::<HELLO_COOKIE_LEN>()?;
				let signature = reader.signature()?;
				verify_sender(
					SignatureKind::PeerToPeer,
					&sender,
					&key,
					&data[..HELLO_SIGNED_LEN],
					&signature,
				)?;

				let hello = Hello {
					sender,
					recipient,
					cookie,
				};
				Ok(if kind == P2P_HELLO {
					PeerMessage::Hello(hello)
				} else {
					PeerMessage::HelloReply(hello)
				})
			}
			P2P_DATA => Ok(PeerMessage::Data(data[1..].to_vec())),
			_ => Err(WireError::InvalidKind(kind)),
		}
	}
}

fn encode_hello_kind(
	kind: u8,
	identity: &Identity,
	recipient: &DeviceAddress,
	cookie: &HelloCookie,
) -> Vec<u8> {
	let mut buf = Vec::with_capacity(HELLO_LEN);
	buf.put_u8(kind);
	buf.put_slice(identity.address().as_bytes());
	buf.put_slice(identity.public_key().as_bytes());
	buf.put_slice(recipient.as_bytes());
	buf.put_slice(cookie);
	let signature = identity.sign(SignatureKind::PeerToPeer, &buf);
	buf.put_slice(&signature);
	buf
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_hello_roundtrip() {
		let identity = Identity::generate();
		let recipient: DeviceAddress = "fc94::1".parse().unwrap();
		let cookie = [7u8; HELLO_COOKIE_LEN];

		let encoded = PeerMessage::encode_hello(&identity, &recipient, &cookie);
		assert_eq!(encoded.len(), HELLO_LEN);
		assert!(PeerMessage::needs_verification(&encoded));

		let decoded = PeerMessage::decode(&encoded).unwrap();
		assert_eq!(
			decoded,
			PeerMessage::Hello(Hello {
				sender: identity.address(),
				recipient,
				cookie,
			})
		);
	}

	#[test]
	fn test_hello_reply_kind() {
		let identity = Identity::generate();
		let encoded =
			PeerMessage::encode_hello_reply(&identity, &DeviceAddress::BAD, &[0u8; HELLO_COOKIE_LEN]);
		let decoded = PeerMessage::decode(&encoded).unwrap();
		assert_eq!(decoded.kind(), P2P_HELLO_REPLY);
	}

	#[test]
	fn test_tampered_hello_is_rejected() {
		let identity = Identity::generate();
		let mut encoded =
			PeerMessage::encode_hello(&identity, &DeviceAddress::BAD, &[1u8; HELLO_COOKIE_LEN]);
		encoded[70] ^= 0xff;
		assert!(matches!(
			PeerMessage::decode(&encoded),
			Err(WireError::BadSignature)
		));
	}

	#[test]
	fn test_sender_must_match_key() {
		let identity = Identity::generate();
		let mut encoded =
			PeerMessage::encode_hello(&identity, &DeviceAddress::BAD, &[1u8; HELLO_COOKIE_LEN]);
		encoded[5] ^= 0x01;
		assert!(matches!(
			PeerMessage::decode(&encoded),
			Err(WireError::AddressMismatch)
		));
	}

	#[test]
	fn test_hello_wrong_length() {
		let data = vec![P2P_HELLO; 100];
		assert!(matches!(
			PeerMessage::decode(&data),
			Err(WireError::InvalidLength { kind: 0, len: 100 })
		));
	}

	#[test]
	fn test_data_passthrough() {
		let encoded = PeerMessage::encode_data(b"payload");
		assert!(!PeerMessage::needs_verification(&encoded));
		assert_eq!(
			PeerMessage::decode(&encoded).unwrap(),
			PeerMessage::Data(b"payload".to_vec())
		);
	}

	#[test]
	fn test_empty_and_unknown() {
		assert!(matches!(PeerMessage::decode(&[]), Err(WireError::Empty)));
		assert!(matches!(
			PeerMessage::decode(&[9, 1, 2]),
			Err(WireError::InvalidKind(9))
		));
	}
}
