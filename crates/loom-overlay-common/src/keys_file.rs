// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::device::{DeviceAddress, Identity};
use crate::keys::{IdentityKeyPair, KeyError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{instrument, warn};

pub const IDENTITY_FILE_NAME: &str = "id";

#[derive(Error, Debug)]
pub enum KeyFileError {
	#[error("failed to read identity file: {0}")]
	Read(#[from] std::io::Error),

	#[error("invalid key format: {0}")]
	InvalidFormat(#[from] KeyError),

	#[error("malformed identity file: {0}")]
	Malformed(String),

	#[error("failed to get home directory")]
	NoHomeDir,
}

pub type Result<T> = std::result::Result<T, KeyFileError>;

/// Parses `"<device address> <public hex> <private hex>"`.
pub fn parse_identity(content: &str) -> Result<Identity> {
	let mut fields = content.split_whitespace();
	let (Some(address), Some(public_hex), Some(private_hex)) =
		(fields.next(), fields.next(), fields.next())
	else {
		return Err(KeyFileError::Malformed("expected three fields".to_string()));
	};

	let address: DeviceAddress = address
		.parse()
		.map_err(|e| KeyFileError::Malformed(format!("{e}")))?;
	let keypair = IdentityKeyPair::from_hex(private_hex)?;
	if keypair.public_key().to_hex() != public_hex.to_ascii_lowercase() {
		return Err(KeyFileError::Malformed(
			"public key does not match private key".to_string(),
		));
	}

	let identity = Identity::from_keypair(keypair)?;
	if identity.address() != address {
		return Err(KeyFileError::Malformed(
			"device address does not match public key".to_string(),
		));
	}
	Ok(identity)
}

pub fn format_identity(identity: &Identity) -> String {
	let private_hex = identity.keypair().private_key().to_hex();
	format!(
		"{} {} {}\n",
		identity.address(),
		identity.public_key().to_hex(),
		private_hex.as_str()
	)
}

#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn load_identity_from_file(path: impl AsRef<Path>) -> Result<Identity> {
	let content = fs::read_to_string(path.as_ref()).await?;
	parse_identity(&content)
}

#[instrument(skip(identity), fields(path = %path.as_ref().display(), address = %identity.address()))]
pub async fn save_identity_to_file(identity: &Identity, path: impl AsRef<Path>) -> Result<()> {
	let path = path.as_ref();

	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await?;
	}

	let content = zeroize::Zeroizing::new(format_identity(identity));

	#[cfg(unix)]
	{
		use tokio::fs::OpenOptions;
		use tokio::io::AsyncWriteExt;

		let mut file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(0o600)
			.open(path)
			.await?;
		file.write_all(content.as_bytes()).await?;
	}

	#[cfg(not(unix))]
	{
		fs::write(path, content.as_bytes()).await?;
	}

	Ok(())
}

/// Loads `state_dir/id`, generating and saving a fresh identity when the file
/// is missing or unusable.
#[instrument(skip(state_dir))]
pub async fn get_or_create_identity(state_dir: impl AsRef<Path>) -> Result<Identity> {
	let path = state_dir.as_ref().join(IDENTITY_FILE_NAME);

	if path.exists() {
		match load_identity_from_file(&path).await {
			Ok(identity) => return Ok(identity),
			Err(KeyFileError::Read(e)) => return Err(KeyFileError::Read(e)),
			Err(e) => {
				warn!(error = %e, "identity file is invalid, regenerating");
			}
		}
	}

	let identity = Identity::generate();
	save_identity_to_file(&identity, &path).await?;
	Ok(identity)
}

pub fn default_state_dir() -> Result<PathBuf> {
	dirs::home_dir()
		.map(|h| h.join(".loom").join("overlay"))
		.ok_or(KeyFileError::NoHomeDir)
}
