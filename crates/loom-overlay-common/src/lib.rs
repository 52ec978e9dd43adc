// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod device;
pub mod flags;
pub mod ip;
pub mod keys;
pub mod keys_file;

pub use device::{DeviceAddress, DeviceAddressError, Identity, DEVICE_ADDRESS_LEN, OVERLAY_PREFIX};
pub use flags::PeerFlags;
pub use ip::{
	canonical_addr, canonical_ip, is_link_local, is_local_network, is_overlay_ip, is_private_v4,
	to_ipv6, OVERLAY_NETWORK,
};
pub use keys::{
	IdentityKeyPair, IdentityPrivateKey, IdentityPublicKey, KeyError, SignatureKind,
	PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
pub use keys_file::{
	default_state_dir, get_or_create_identity, load_identity_from_file, save_identity_to_file,
	KeyFileError, IDENTITY_FILE_NAME,
};
