// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Long-term Ed25519 signing keys.
//!
//! Every signature is domain separated by a [`SignatureKind`] so a signature
//! produced for one dialect can never be replayed as another.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
const SEED_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("invalid key length: expected {expected} bytes, got {actual}")]
	InvalidLength { expected: usize, actual: usize },

	#[error("invalid hex encoding: {0}")]
	InvalidHex(#[from] hex::FromHexError),

	#[error("invalid public key")]
	InvalidPublicKey,

	#[error("private key does not match its embedded public key")]
	KeypairMismatch,

	#[error("public key does not derive a valid device address")]
	InvalidDeviceAddress,

	#[error("signature verification failed")]
	BadSignature,
}

pub type Result<T> = std::result::Result<T, KeyError>;

/// Signing domain. The signed message is `tag || "\n" || data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
	PeerToPeer,
	PeerToBase,
	KeyExchange,
}

impl SignatureKind {
	pub fn tag(&self) -> &'static str {
		match self {
			SignatureKind::PeerToPeer => "ng-p2p-msg",
			SignatureKind::PeerToBase => "ng-p2b-msg",
			SignatureKind::KeyExchange => "ng-kx-pubkey",
		}
	}

	fn message(&self, data: &[u8]) -> Vec<u8> {
		let tag = self.tag().as_bytes();
		let mut message = Vec::with_capacity(tag.len() + 1 + data.len());
		message.extend_from_slice(tag);
		message.push(b'\n');
		message.extend_from_slice(data);
		message
	}
}

#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct IdentityPrivateKey {
	seed: [u8; SEED_LEN],
}

impl IdentityPrivateKey {
	pub fn generate() -> Self {
		let mut seed = [0u8; SEED_LEN];
		OsRng.fill_bytes(&mut seed);
		Self { seed }
	}

	pub fn from_bytes(seed: [u8; SEED_LEN]) -> Self {
		Self { seed }
	}

	/// Accepts either the bare 32-byte seed or the 64-byte `seed || public`
	/// keypair form written by [`IdentityPrivateKey::to_hex`].
	pub fn from_hex(s: &str) -> Result<Self> {
		let bytes = Zeroizing::new(hex::decode(s)?);
		match bytes.len() {
			SEED_LEN => {
				let mut seed = [0u8; SEED_LEN];
				seed.copy_from_slice(&bytes);
				Ok(Self { seed })
			}
			64 => {
				let mut seed = [0u8; SEED_LEN];
				seed.copy_from_slice(&bytes[..SEED_LEN]);
				let private = Self { seed };
				if private.public_key().as_bytes()[..] != bytes[SEED_LEN..] {
					return Err(KeyError::KeypairMismatch);
				}
				Ok(private)
			}
			actual => Err(KeyError::InvalidLength {
				expected: 64,
				actual,
			}),
		}
	}

	pub fn to_hex(&self) -> Zeroizing<String> {
		let mut keypair = Zeroizing::new([0u8; 64]);
		keypair[..SEED_LEN].copy_from_slice(&self.seed);
		keypair[SEED_LEN..].copy_from_slice(self.public_key().as_bytes());
		Zeroizing::new(hex::encode(&keypair[..]))
	}

	pub fn public_key(&self) -> IdentityPublicKey {
		let signing = SigningKey::from_bytes(&self.seed);
		IdentityPublicKey {
			bytes: signing.verifying_key().to_bytes(),
		}
	}

	pub fn sign(&self, kind: SignatureKind, data: &[u8]) -> [u8; SIGNATURE_LEN] {
		let signing = SigningKey::from_bytes(&self.seed);
		signing.sign(&kind.message(data)).to_bytes()
	}

	pub fn expose_bytes(&self) -> &[u8; SEED_LEN] {
		&self.seed
	}
}

impl fmt::Debug for IdentityPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("IdentityPrivateKey")
			.field("seed", &"[REDACTED]")
			.finish()
	}
}

impl fmt::Display for IdentityPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("[REDACTED]")
	}
}

impl Serialize for IdentityPrivateKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str("[REDACTED]")
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityPublicKey {
	bytes: [u8; PUBLIC_KEY_LEN],
}

impl IdentityPublicKey {
	pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
		Self { bytes }
	}

	pub fn from_slice(bytes: &[u8]) -> Result<Self> {
		let bytes: [u8; PUBLIC_KEY_LEN] =
			bytes.try_into().map_err(|_| KeyError::InvalidLength {
				expected: PUBLIC_KEY_LEN,
				actual: bytes.len(),
			})?;
		Ok(Self { bytes })
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		Self::from_slice(&hex::decode(s)?)
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.bytes)
	}

	pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
		&self.bytes
	}

	pub fn verify(&self, kind: SignatureKind, data: &[u8], signature: &[u8]) -> Result<()> {
		let signature: [u8; SIGNATURE_LEN] =
			signature.try_into().map_err(|_| KeyError::InvalidLength {
				expected: SIGNATURE_LEN,
				actual: signature.len(),
			})?;
		let key = VerifyingKey::from_bytes(&self.bytes).map_err(|_| KeyError::InvalidPublicKey)?;
		key.verify(&kind.message(data), &Signature::from_bytes(&signature))
			.map_err(|_| KeyError::BadSignature)
	}
}

impl fmt::Debug for IdentityPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let hex = self.to_hex();
		f.debug_struct("IdentityPublicKey")
			.field("prefix", &format!("{}...", &hex[..8]))
			.finish()
	}
}

impl fmt::Display for IdentityPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_hex())
	}
}

impl Serialize for IdentityPublicKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_hex())
	}
}

impl<'de> Deserialize<'de> for IdentityPublicKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Self::from_hex(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(Clone)]
pub struct IdentityKeyPair {
	private: IdentityPrivateKey,
	public: IdentityPublicKey,
}

impl IdentityKeyPair {
	pub fn generate() -> Self {
		Self::from_private_key(IdentityPrivateKey::generate())
	}

	pub fn from_private_key(private: IdentityPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn from_hex(private_key_hex: &str) -> Result<Self> {
		let private = IdentityPrivateKey::from_hex(private_key_hex)?;
		Ok(Self::from_private_key(private))
	}

	pub fn private_key(&self) -> &IdentityPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &IdentityPublicKey {
		&self.public
	}

	pub fn sign(&self, kind: SignatureKind, data: &[u8]) -> [u8; SIGNATURE_LEN] {
		self.private.sign(kind, data)
	}
}

impl fmt::Debug for IdentityKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("IdentityKeyPair")
			.field("private", &self.private)
			.field("public", &self.public)
			.finish()
	}
}
