// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-peer session cryptography: X25519 key agreement, directional key
//! derivation, capability-flag mixing, XChaCha20-Poly1305 sealing and the
//! receive replay window.

use crate::error::SessionError;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use loom_overlay_common::{DeviceAddress, PeerFlags};
use loom_overlay_wire::NONCE_LEN;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const SESSION_KEY_LEN: usize = 32;
pub const REPLAY_WINDOW_SIZE: u64 = 64;

#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
	pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
		Self(bytes)
	}

	pub fn expose_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
		&self.0
	}
}

impl fmt::Debug for SessionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SessionKey([REDACTED])")
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
	pub rx: SessionKey,
	pub tx: SessionKey,
}

/// Role in the key agreement. The numerically smaller device address is
/// always the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KxRole {
	Client,
	Server,
}

impl KxRole {
	pub fn for_addresses(me: &DeviceAddress, peer: &DeviceAddress) -> Self {
		if me < peer {
			KxRole::Client
		} else {
			KxRole::Server
		}
	}
}

pub struct KxKeypair {
	secret: StaticSecret,
	public: [u8; 32],
}

impl KxKeypair {
	pub fn generate() -> Self {
		let secret = StaticSecret::random_from_rng(OsRng);
		let public = PublicKey::from(&secret).to_bytes();
		Self { secret, public }
	}

	pub fn public(&self) -> &[u8; 32] {
		&self.public
	}

	/// Derives the directional session keys shared with `peer_public`.
	pub fn derive(&self, peer_public: &[u8; 32], role: KxRole) -> Result<SessionKeys, SessionError> {
		let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
		if !shared.was_contributory() {
			return Err(SessionError::NonContributory);
		}

		let (client_public, server_public) = match role {
			KxRole::Client => (&self.public, peer_public),
			KxRole::Server => (peer_public, &self.public),
		};
		let mut hasher = Sha512::new();
		hasher.update(shared.as_bytes());
		hasher.update(client_public);
		hasher.update(server_public);
		let digest = hasher.finalize();

		let mut first = [0u8; SESSION_KEY_LEN];
		let mut second = [0u8; SESSION_KEY_LEN];
		first.copy_from_slice(&digest[..SESSION_KEY_LEN]);
		second.copy_from_slice(&digest[SESSION_KEY_LEN..]);
		let (first, second) = (SessionKey(first), SessionKey(second));

		Ok(match role {
			KxRole::Client => SessionKeys {
				rx: first,
				tx: second,
			},
			KxRole::Server => SessionKeys {
				rx: second,
				tx: first,
			},
		})
	}
}

impl fmt::Debug for KxKeypair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KxKeypair")
			.field("public", &hex::encode(&self.public[..4]))
			.finish_non_exhaustive()
	}
}

/// Binds both keys to the capability flags each side declared, so peers
/// that disagree on flags cannot decrypt each other.
pub fn mix_flags(keys: &SessionKeys, my_flags: PeerFlags, peer_flags: PeerFlags) -> SessionKeys {
	let mix = |key: &SessionKey, first: PeerFlags, second: PeerFlags| {
		let mut hasher = Sha256::new();
		hasher.update(key.0);
		hasher.update(first.bits().to_be_bytes());
		hasher.update(second.bits().to_be_bytes());
		SessionKey(hasher.finalize().into())
	};
	SessionKeys {
		rx: mix(&keys.rx, peer_flags, my_flags),
		tx: mix(&keys.tx, my_flags, peer_flags),
	}
}

/// Encrypts `counter || payload` under a fresh random nonce.
pub fn seal(
	key: &SessionKey,
	counter: u64,
	payload: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), SessionError> {
	let cipher = XChaCha20Poly1305::new(Key::from_slice(&key.0));
	let mut nonce = [0u8; NONCE_LEN];
	OsRng.fill_bytes(&mut nonce);

	let mut plaintext = Vec::with_capacity(8 + payload.len());
	plaintext.extend_from_slice(&counter.to_be_bytes());
	plaintext.extend_from_slice(payload);

	let ciphertext = cipher
		.encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
		.map_err(|_| SessionError::Seal)?;
	Ok((nonce, ciphertext))
}

/// Decrypts a data frame body into its counter and payload.
pub fn open(
	key: &SessionKey,
	nonce: &[u8; NONCE_LEN],
	ciphertext: &[u8],
) -> Result<(u64, Vec<u8>), SessionError> {
	let cipher = XChaCha20Poly1305::new(Key::from_slice(&key.0));
	let plaintext = cipher
		.decrypt(XNonce::from_slice(nonce), ciphertext)
		.map_err(|_| SessionError::Forged)?;
	if plaintext.len() < 8 {
		return Err(SessionError::Truncated);
	}
	let mut counter = [0u8; 8];
	counter.copy_from_slice(&plaintext[..8]);
	Ok((u64::from_be_bytes(counter), plaintext[8..].to_vec()))
}

/// Sliding window over the last [`REPLAY_WINDOW_SIZE`] receive counters.
/// Bit 0 of `seen` is `highest`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayWindow {
	highest: u64,
	seen: u64,
}

impl ReplayWindow {
	/// Accepts `counter` once. Zero, duplicates and counters older than the
	/// window are rejected.
	pub fn accept(&mut self, counter: u64) -> bool {
		if counter == 0 {
			return false;
		}
		if counter > self.highest {
			let shift = counter - self.highest;
			self.seen = if shift >= REPLAY_WINDOW_SIZE {
				0
			} else {
				self.seen << shift
			};
			self.seen |= 1;
			self.highest = counter;
			return true;
		}

		let offset = self.highest - counter;
		if offset >= REPLAY_WINDOW_SIZE {
			return false;
		}
		let bit = 1u64 << offset;
		if self.seen & bit != 0 {
			return false;
		}
		self.seen |= bit;
		true
	}

	pub fn reset(&mut self) {
		*self = Self::default();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	fn negotiated_pair() -> (SessionKeys, SessionKeys) {
		let a = KxKeypair::generate();
		let b = KxKeypair::generate();
		let a_keys = a.derive(b.public(), KxRole::Client).unwrap();
		let b_keys = b.derive(a.public(), KxRole::Server).unwrap();
		(a_keys, b_keys)
	}

	#[test]
	fn test_roles_follow_address_order() {
		let low: DeviceAddress = "fc94::1".parse().unwrap();
		let high: DeviceAddress = "fc94::2".parse().unwrap();
		assert_eq!(KxRole::for_addresses(&low, &high), KxRole::Client);
		assert_eq!(KxRole::for_addresses(&high, &low), KxRole::Server);
	}

	#[test]
	fn test_derived_keys_are_crossed() {
		let (a, b) = negotiated_pair();
		assert_eq!(a.tx, b.rx);
		assert_eq!(a.rx, b.tx);
		assert_ne!(a.rx, a.tx);
	}

	#[test]
	fn test_rederive_is_stable() {
		let a = KxKeypair::generate();
		let b = KxKeypair::generate();
		assert_eq!(
			a.derive(b.public(), KxRole::Client).unwrap(),
			a.derive(b.public(), KxRole::Client).unwrap()
		);
	}

	#[test]
	fn test_low_order_point_rejected() {
		let a = KxKeypair::generate();
		assert_eq!(
			a.derive(&[0u8; 32], KxRole::Client),
			Err(SessionError::NonContributory)
		);
	}

	#[test]
	fn test_flag_mixing_agrees_when_flags_match() {
		let (a, b) = negotiated_pair();
		let a_flags = PeerFlags::default();
		let b_flags = PeerFlags::from_bits(PeerFlags::SUPPORTS_FLAGS);
		let a_mixed = mix_flags(&a, a_flags, b_flags);
		let b_mixed = mix_flags(&b, b_flags, a_flags);
		assert_eq!(a_mixed.tx, b_mixed.rx);
		assert_eq!(a_mixed.rx, b_mixed.tx);
		assert_ne!(a_mixed.tx, a.tx);
	}

	#[test]
	fn test_flag_mismatch_breaks_decryption() {
		let (a, b) = negotiated_pair();
		let a_mixed = mix_flags(&a, PeerFlags::default(), PeerFlags::default());
		let b_mixed = mix_flags(
			&b,
			PeerFlags::from_bits(PeerFlags::SUPPORTS_FLAGS | PeerFlags::COMPRESSION),
			PeerFlags::default(),
		);
		let (nonce, ciphertext) = seal(&a_mixed.tx, 1, b"hello").unwrap();
		assert_eq!(
			open(&b_mixed.rx, &nonce, &ciphertext),
			Err(SessionError::Forged)
		);
	}

	#[test]
	fn test_session_key_debug_redacted() {
		let key = SessionKey::from_bytes([0xab; SESSION_KEY_LEN]);
		assert!(!format!("{key:?}").contains("ab"));
	}

	#[test]
	fn test_replay_window_rejects_duplicates() {
		let mut window = ReplayWindow::default();
		assert!(!window.accept(0));
		assert!(window.accept(1));
		assert!(!window.accept(1));
		assert!(window.accept(3));
		assert!(window.accept(2));
		assert!(!window.accept(2));
	}

	#[test]
	fn test_replay_window_rejects_too_old() {
		let mut window = ReplayWindow::default();
		assert!(window.accept(100));
		assert!(window.accept(37));
		assert!(!window.accept(36));
		assert!(window.accept(200));
		assert!(!window.accept(100));
	}

	#[test]
	fn test_replay_window_reset() {
		let mut window = ReplayWindow::default();
		assert!(window.accept(5));
		window.reset();
		assert!(window.accept(5));
	}

	proptest! {
		#[test]
		fn seal_open_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..512), counter in 1u64..) {
			let (a, b) = negotiated_pair();
			let (nonce, ciphertext) = seal(&a.tx, counter, &payload).unwrap();
			let (opened_counter, opened) = open(&b.rx, &nonce, &ciphertext).unwrap();
			prop_assert_eq!(opened_counter, counter);
			prop_assert_eq!(opened, payload);
		}

		#[test]
		fn tampering_is_detected(
			payload in proptest::collection::vec(any::<u8>(), 1..256),
			index in any::<prop::sample::Index>(),
			flip in 1u8..,
			in_nonce in any::<bool>(),
		) {
			let (a, b) = negotiated_pair();
			let (mut nonce, mut ciphertext) = seal(&a.tx, 1, &payload).unwrap();
			if in_nonce {
				nonce[index.index(NONCE_LEN)] ^= flip;
			} else {
				let i = index.index(ciphertext.len());
				ciphertext[i] ^= flip;
			}
			prop_assert_eq!(open(&b.rx, &nonce, &ciphertext), Err(SessionError::Forged));
		}
	}
}
