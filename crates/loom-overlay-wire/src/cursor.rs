// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{Result, WireError};
use bytes::BufMut;
use loom_overlay_common::{
	canonical_addr, to_ipv6, DeviceAddress, IdentityPublicKey, SignatureKind, DEVICE_ADDRESS_LEN,
	PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// `ip:16` followed by `port:2` big-endian.
pub const PACKED_ADDR_LEN: usize = 18;

pub fn put_socket_addr(buf: &mut impl BufMut, addr: &SocketAddr) {
	buf.put_slice(&to_ipv6(addr.ip()).octets());
	buf.put_u16(addr.port());
}

/// Checks that `sender` is the address derived from `key` and that
/// `signature` covers `signed`.
pub(crate) fn verify_sender(
	kind: SignatureKind,
	sender: &DeviceAddress,
	key: &IdentityPublicKey,
	signed: &[u8],
	signature: &[u8],
) -> Result<()> {
	let derived = DeviceAddress::from_public_key(key);
	if !derived.is_valid() || derived != *sender {
		return Err(WireError::AddressMismatch);
	}
	key.verify(kind, signed, signature)
		.map_err(|_| WireError::BadSignature)
}

/// Forward-only reader that checks bounds before every field.
pub(crate) struct Reader<'a> {
	kind: u8,
	buf: &'a [u8],
}

impl<'a> Reader<'a> {
	pub(crate) fn new(kind: u8, buf: &'a [u8]) -> Self {
		Self { kind, buf }
	}

	pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
		if self.buf.len() < n {
			return Err(WireError::PayloadTooShort(self.kind));
		}
		let (head, tail) = self.buf.split_at(n);
		self.buf = tail;
		Ok(head)
	}

	pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
		let mut out = [0u8; N];
		out.copy_from_slice(self.take(N)?);
		Ok(out)
	}

	pub(crate) fn u16(&mut self) -> Result<u16> {
		Ok(u16::from_be_bytes(self.array()?))
	}

	pub(crate) fn u64(&mut self) -> Result<u64> {
		Ok(u64::from_be_bytes(self.array()?))
	}

	pub(crate) fn device_address(&mut self) -> Result<DeviceAddress> {
		Ok(DeviceAddress::from_bytes(self.array::<DEVICE_ADDRESS_LEN>()?))
	}

	pub(crate) fn public_key(&mut self) -> Result<IdentityPublicKey> {
		Ok(IdentityPublicKey::from_bytes(self.array::<PUBLIC_KEY_LEN>()?))
	}

	pub(crate) fn signature(&mut self) -> Result<[u8; SIGNATURE_LEN]> {
		self.array()
	}

	pub(crate) fn socket_addr(&mut self) -> Result<SocketAddr> {
		let ip = Ipv6Addr::from(self.array::<16>()?);
		let port = self.u16()?;
		Ok(canonical_addr(SocketAddr::new(IpAddr::V6(ip), port)))
	}

	pub(crate) fn remaining(&self) -> usize {
		self.buf.len()
	}

	pub(crate) fn rest(&mut self) -> &'a [u8] {
		std::mem::take(&mut self.buf)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn v4_address_packs_mapped_and_unpacks_plain() {
		let addr: SocketAddr = "10.1.2.3:5582".parse().unwrap();
		let mut buf = Vec::new();
		put_socket_addr(&mut buf, &addr);
		assert_eq!(buf.len(), PACKED_ADDR_LEN);
		assert_eq!(&buf[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
		assert_eq!(&buf[16..], &[0x15, 0xce]);

		let mut reader = Reader::new(0, &buf);
		assert_eq!(reader.socket_addr().unwrap(), addr);
		assert_eq!(reader.remaining(), 0);
	}

	#[test]
	fn v6_address_roundtrips() {
		let addr: SocketAddr = "[2001:db8::7]:443".parse().unwrap();
		let mut buf = Vec::new();
		put_socket_addr(&mut buf, &addr);
		assert_eq!(Reader::new(0, &buf).socket_addr().unwrap(), addr);
	}

	#[test]
	fn short_read_reports_kind() {
		let mut reader = Reader::new(7, &[1, 2, 3]);
		assert!(matches!(reader.u64(), Err(WireError::PayloadTooShort(7))));
	}

	#[test]
	fn rest_consumes_everything() {
		let mut reader = Reader::new(0, &[1, 2, 3, 4]);
		assert_eq!(reader.u16().unwrap(), 0x0102);
		assert_eq!(reader.rest(), &[3, 4]);
		assert_eq!(reader.remaining(), 0);
	}
}
