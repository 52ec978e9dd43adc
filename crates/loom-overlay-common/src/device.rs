// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::{IdentityKeyPair, IdentityPublicKey, KeyError, SignatureKind, SIGNATURE_LEN};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use thiserror::Error;

pub const DEVICE_ADDRESS_LEN: usize = 16;

/// Reserved prefix carried by every routable device address.
pub const OVERLAY_PREFIX: [u8; 2] = [0xfc, 0x94];

/// Proof-of-work bound on the second hash byte.
const POW_LIMIT: u8 = 50;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeviceAddressError {
	#[error("invalid device address: {0}")]
	InvalidFormat(String),

	#[error("address is outside the overlay range: {0}")]
	NotOverlay(String),
}

/// 16-byte overlay address derived from an identity public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceAddress([u8; DEVICE_ADDRESS_LEN]);

impl DeviceAddress {
	/// Poisoned sentinel returned when derivation fails. Never routed to.
	pub const BAD: DeviceAddress = DeviceAddress([0; DEVICE_ADDRESS_LEN]);

	pub fn from_bytes(bytes: [u8; DEVICE_ADDRESS_LEN]) -> Self {
		Self(bytes)
	}

	pub fn from_slice(bytes: &[u8]) -> Option<Self> {
		bytes.try_into().ok().map(Self)
	}

	/// Derives the address for `key`, or [`DeviceAddress::BAD`] when the key
	/// does not satisfy the proof-of-work constraint.
	pub fn from_public_key(key: &IdentityPublicKey) -> Self {
		let hash = Sha256::digest(key.as_bytes());
		if hash[0] != 0 || hash[1] >= POW_LIMIT {
			return Self::BAD;
		}
		let mut bytes = [0u8; DEVICE_ADDRESS_LEN];
		bytes[..2].copy_from_slice(&OVERLAY_PREFIX);
		bytes[2..].copy_from_slice(&hash[3..17]);
		Self(bytes)
	}

	pub fn is_valid(&self) -> bool {
		self.0[..2] == OVERLAY_PREFIX
	}

	pub fn as_bytes(&self) -> &[u8; DEVICE_ADDRESS_LEN] {
		&self.0
	}

	pub fn to_ipv6(&self) -> Ipv6Addr {
		Ipv6Addr::from(self.0)
	}
}

impl From<Ipv6Addr> for DeviceAddress {
	fn from(ip: Ipv6Addr) -> Self {
		Self(ip.octets())
	}
}

impl fmt::Debug for DeviceAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "DeviceAddress({})", self.to_ipv6())
	}
}

impl fmt::Display for DeviceAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_ipv6())
	}
}

impl FromStr for DeviceAddress {
	type Err = DeviceAddressError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let ip: Ipv6Addr = s
			.trim()
			.parse()
			.map_err(|_| DeviceAddressError::InvalidFormat(s.to_string()))?;
		let address = Self::from(ip);
		if !address.is_valid() {
			return Err(DeviceAddressError::NotOverlay(s.to_string()));
		}
		Ok(address)
	}
}

impl Serialize for DeviceAddress {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for DeviceAddress {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// A signing keypair together with the device address it derives.
#[derive(Clone)]
pub struct Identity {
	keypair: IdentityKeyPair,
	address: DeviceAddress,
}

impl Identity {
	/// Generates keypairs until one derives a valid address.
	pub fn generate() -> Self {
		loop {
			let keypair = IdentityKeyPair::generate();
			if let Ok(identity) = Self::from_keypair(keypair) {
				return identity;
			}
		}
	}

	pub fn from_keypair(keypair: IdentityKeyPair) -> Result<Self, KeyError> {
		let address = DeviceAddress::from_public_key(keypair.public_key());
		if !address.is_valid() {
			return Err(KeyError::InvalidDeviceAddress);
		}
		Ok(Self { keypair, address })
	}

	pub fn address(&self) -> DeviceAddress {
		self.address
	}

	pub fn public_key(&self) -> &IdentityPublicKey {
		self.keypair.public_key()
	}

	pub fn keypair(&self) -> &IdentityKeyPair {
		&self.keypair
	}

	pub fn sign(&self, kind: SignatureKind, data: &[u8]) -> [u8; SIGNATURE_LEN] {
		self.keypair.sign(kind, data)
	}
}

impl fmt::Debug for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Identity")
			.field("address", &self.address)
			.field("public", self.keypair.public_key())
			.finish()
	}
}
