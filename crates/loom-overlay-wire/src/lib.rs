// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod base;
pub mod beacon;
mod cursor;
pub mod error;
pub mod framing;
pub mod peer;
pub mod security;

pub use base::{BaseCookie, BaseToPeer, PeerToBase, PeerToBaseEnvelope, BASE_COOKIE_LEN};
pub use beacon::Beacon;
pub use cursor::{put_socket_addr, PACKED_ADDR_LEN};
pub use error::{Result, WireError, MAX_FRAME_SIZE};
pub use framing::{encode_frame, read_frame, write_frame, FRAME_TAG};
pub use peer::{Hello, HelloCookie, PeerMessage, HELLO_COOKIE_LEN};
pub use security::{HelloStep, SecurityHello, SecurityPacket, HEARTBEAT_TOKEN_LEN, NONCE_LEN};

#[cfg(test)]
mod tests {
	use super::*;
	use loom_overlay_common::Identity;
	use proptest::prelude::*;

	proptest! {
		#[test]
		fn decoders_never_panic(data in proptest::collection::vec(any::<u8>(), 0..256)) {
			let _ = PeerMessage::decode(&data);
			let _ = PeerToBase::decode(&data);
			let _ = BaseToPeer::decode(&data);
			let _ = SecurityPacket::decode(&data);
			let _ = Beacon::decode(&data);
		}

		#[test]
		fn truncated_hello_rejected(cut in 1usize..200) {
			let identity = Identity::generate();
			let encoded = PeerMessage::encode_hello(&identity, &identity.address(), &[3u8; HELLO_COOKIE_LEN]);
			let len = encoded.len().saturating_sub(cut);
			prop_assert!(PeerMessage::decode(&encoded[..len]).is_err());
		}

		#[test]
		fn truncated_beacon_rejected(len in 0usize..beacon::BEACON_LEN) {
			let beacon = Beacon { port: 5582, device: Identity::generate().address() };
			let encoded = beacon.encode();
			prop_assert!(Beacon::decode(&encoded[..len]).is_err());
		}
	}
}
