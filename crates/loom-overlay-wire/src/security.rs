// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Frames exchanged by the security layer inside engine DATA messages.

use crate::cursor::{verify_sender, Reader};
use crate::error::{Result, WireError};
use bytes::BufMut;
use loom_overlay_common::{DeviceAddress, Identity, PeerFlags, SignatureKind, SIGNATURE_LEN};

pub const SEC_DATA: u8 = 0;
pub const SEC_HELLO_INITIATE: u8 = 1;
pub const SEC_HELLO_RESPOND: u8 = 2;
pub const SEC_HELLO_CONFIRM: u8 = 3;
pub const SEC_HEARTBEAT: u8 = 4;
pub const SEC_HEARTBEAT_REPLY: u8 = 5;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const COUNTER_LEN: usize = 8;
pub const KX_PUBLIC_LEN: usize = 32;
pub const HEARTBEAT_TOKEN_LEN: usize = 8;

/// Smallest data frame that can hold a nonce, a tag and the counter.
pub const MIN_DATA_FRAME_LEN: usize = 1 + NONCE_LEN + TAG_LEN + COUNTER_LEN;

pub const SECURITY_HELLO_LEN: usize = 1 + 16 + 32 + KX_PUBLIC_LEN + 16 + 8 + 8 + SIGNATURE_LEN;
pub const SECURITY_HELLO_WITH_FLAGS_LEN: usize = SECURITY_HELLO_LEN + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloStep {
	Initiate,
	Respond,
	Confirm,
}

impl HelloStep {
	pub fn kind(&self) -> u8 {
		match self {
			HelloStep::Initiate => SEC_HELLO_INITIATE,
			HelloStep::Respond => SEC_HELLO_RESPOND,
			HelloStep::Confirm => SEC_HELLO_CONFIRM,
		}
	}

	fn from_kind(kind: u8) -> Option<Self> {
		match kind {
			SEC_HELLO_INITIATE => Some(HelloStep::Initiate),
			SEC_HELLO_RESPOND => Some(HelloStep::Respond),
			SEC_HELLO_CONFIRM => Some(HelloStep::Confirm),
			_ => None,
		}
	}
}

/// Signed key-exchange hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityHello {
	pub step: HelloStep,
	pub sender: DeviceAddress,
	pub kx_public: [u8; KX_PUBLIC_LEN],
	pub recipient: DeviceAddress,
	pub helloseq: u64,
	pub echoed_helloseq: u64,
	pub flags: Option<PeerFlags>,
}

impl SecurityHello {
	/// Encodes and signs the hello. The sender fields come from `identity`.
	pub fn encode(&self, identity: &Identity) -> Vec<u8> {
		let mut buf = Vec::with_capacity(SECURITY_HELLO_WITH_FLAGS_LEN);
		buf.put_u8(self.step.kind());
		buf.put_slice(identity.address().as_bytes());
		buf.put_slice(identity.public_key().as_bytes());
		buf.put_slice(&self.kx_public);
		buf.put_slice(self.recipient.as_bytes());
		buf.put_u64(self.helloseq);
		buf.put_u64(self.echoed_helloseq);
		if let Some(flags) = self.flags {
			buf.put_u64(flags.bits());
		}
		let signature = identity.sign(SignatureKind::KeyExchange, &buf);
		buf.put_slice(&signature);
		buf
	}

	fn decode(step: HelloStep, data: &[u8]) -> Result<Self> {
		let kind = step.kind();
		let has_flags = match data.len() {
			SECURITY_HELLO_LEN => false,
			SECURITY_HELLO_WITH_FLAGS_LEN => true,
			len => return Err(WireError::InvalidLength { kind, len }),
		};

		let signed = &data[..data.len() - SIGNATURE_LEN];
		let mut reader = Reader::new(kind, &data[1..]);
		let sender = reader.device_address()?;
		let key = reader.public_key()?;
		let kx_public = reader.array::<KX_PUBLIC_LEN>()?;
		let recipient = reader.device_address()?;
		let helloseq = reader.u64()?;
		let echoed_helloseq = reader.u64()?;
		let flags = if has_flags {
			Some(PeerFlags::from_bits(reader.u64()?))
		} else {
			None
		};
		let signature = reader.signature()?;
		verify_sender(SignatureKind::KeyExchange, &sender, &key, signed, &signature)?;

		Ok(Self {
			step,
			sender,
			kx_public,
			recipient,
			helloseq,
			echoed_helloseq,
			flags,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityPacket {
	Data {
		nonce: [u8; NONCE_LEN],
		ciphertext: Vec<u8>,
	},
	Hello(SecurityHello),
	Heartbeat([u8; HEARTBEAT_TOKEN_LEN]),
	HeartbeatReply([u8; HEARTBEAT_TOKEN_LEN]),
}

impl SecurityPacket {
	pub fn kind(&self) -> u8 {
		match self {
			SecurityPacket::Data { .. } => SEC_DATA,
			SecurityPacket::Hello(hello) => hello.step.kind(),
			SecurityPacket::Heartbeat(_) => SEC_HEARTBEAT,
			SecurityPacket::HeartbeatReply(_) => SEC_HEARTBEAT_REPLY,
		}
	}

	pub fn encode_data(nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Vec<u8> {
		let mut buf = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
		buf.put_u8(SEC_DATA);
		buf.put_slice(nonce);
		buf.put_slice(ciphertext);
		buf
	}

	pub fn encode_heartbeat(reply: bool, token: &[u8; HEARTBEAT_TOKEN_LEN]) -> Vec<u8> {
		let mut buf = Vec::with_capacity(1 + HEARTBEAT_TOKEN_LEN);
		buf.put_u8(if reply {
			SEC_HEARTBEAT_REPLY
		} else {
			SEC_HEARTBEAT
		});
		buf.put_slice(token);
		buf
	}

	/// Decodes a frame. Hellos are verified against their embedded sender.
	pub fn decode(data: &[u8]) -> Result<Self> {
		let kind = *data.first().ok_or(WireError::Empty)?;
		let mut reader = Reader::new(kind, &data[1..]);
		match kind {
			SEC_DATA => {
				if data.len() < MIN_DATA_FRAME_LEN {
					return Err(WireError::PayloadTooShort(kind));
				}
				let nonce = reader.array::<NONCE_LEN>()?;
				Ok(SecurityPacket::Data {
					nonce,
					ciphertext: reader.rest().to_vec(),
				})
			}
			SEC_HEARTBEAT => Ok(SecurityPacket::Heartbeat(reader.array()?)),
			SEC_HEARTBEAT_REPLY => Ok(SecurityPacket::HeartbeatReply(reader.array()?)),
			_ => match HelloStep::from_kind(kind) {
				Some(step) => Ok(SecurityPacket::Hello(SecurityHello::decode(step, data)?)),
				None => Err(WireError::InvalidKind(kind)),
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hello(step: HelloStep, flags: Option<PeerFlags>) -> SecurityHello {
		SecurityHello {
			step,
			sender: DeviceAddress::BAD,
			kx_public: [4u8; KX_PUBLIC_LEN],
			recipient: "fc94::8".parse().unwrap(),
			helloseq: 0xdead_beef_0000_0001,
			echoed_helloseq: 17,
			flags,
		}
	}

	#[test]
	fn test_hello_lengths() {
		let identity = Identity::generate();
		assert_eq!(
			hello(HelloStep::Initiate, None).encode(&identity).len(),
			SECURITY_HELLO_LEN
		);
		assert_eq!(
			hello(HelloStep::Initiate, Some(PeerFlags::default()))
				.encode(&identity)
				.len(),
			SECURITY_HELLO_WITH_FLAGS_LEN
		);
		assert_eq!(SECURITY_HELLO_LEN, 177);
	}

	#[test]
	fn test_hello_roundtrip_carries_sender() {
		let identity = Identity::generate();
		for step in [HelloStep::Initiate, HelloStep::Respond, HelloStep::Confirm] {
			let original = hello(step, Some(PeerFlags::default()));
			let decoded = SecurityPacket::decode(&original.encode(&identity)).unwrap();
			let SecurityPacket::Hello(decoded) = decoded else {
				panic!("expected hello");
			};
			assert_eq!(decoded.step, step);
			assert_eq!(decoded.sender, identity.address());
			assert_eq!(decoded.helloseq, original.helloseq);
			assert_eq!(decoded.echoed_helloseq, 17);
			assert_eq!(decoded.flags, Some(PeerFlags::default()));
		}
	}

	#[test]
	fn test_hello_signature_covers_helloseq() {
		let identity = Identity::generate();
		let mut encoded = hello(HelloStep::Respond, None).encode(&identity);
		// last byte of the echoed helloseq
		encoded[112] ^= 1;
		assert!(matches!(
			SecurityPacket::decode(&encoded),
			Err(WireError::BadSignature)
		));
	}

	#[test]
	fn test_hello_odd_length_rejected() {
		let identity = Identity::generate();
		let mut encoded = hello(HelloStep::Initiate, None).encode(&identity);
		encoded.push(0);
		assert!(matches!(
			SecurityPacket::decode(&encoded),
			Err(WireError::InvalidLength { kind: 1, len: 178 })
		));
	}

	#[test]
	fn test_short_data_frame_rejected() {
		let frame = vec![SEC_DATA; MIN_DATA_FRAME_LEN - 1];
		assert!(matches!(
			SecurityPacket::decode(&frame),
			Err(WireError::PayloadTooShort(0))
		));
	}

	#[test]
	fn test_data_frame_layout() {
		let nonce = [1u8; NONCE_LEN];
		let ciphertext = vec![2u8; TAG_LEN + COUNTER_LEN + 3];
		let frame = SecurityPacket::encode_data(&nonce, &ciphertext);
		assert_eq!(frame[0], SEC_DATA);
		assert_eq!(
			SecurityPacket::decode(&frame).unwrap(),
			SecurityPacket::Data { nonce, ciphertext }
		);
	}

	#[test]
	fn test_heartbeat_frames() {
		let token = [9u8; HEARTBEAT_TOKEN_LEN];
		assert_eq!(
			SecurityPacket::decode(&SecurityPacket::encode_heartbeat(false, &token)).unwrap(),
			SecurityPacket::Heartbeat(token)
		);
		assert_eq!(
			SecurityPacket::decode(&SecurityPacket::encode_heartbeat(true, &token)).unwrap(),
			SecurityPacket::HeartbeatReply(token)
		);
		assert!(matches!(
			SecurityPacket::decode(&[SEC_HEARTBEAT, 1, 2]),
			Err(WireError::PayloadTooShort(4))
		));
	}
}
