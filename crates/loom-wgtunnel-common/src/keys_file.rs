// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::{WgKeyPair, WgPrivateKey};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum KeyFileError {
	#[error("failed to access key file: {0}")]
	Io(#[from] std::io::Error),

	#[error("invalid key format: {0}")]
	InvalidFormat(#[from] crate::keys::KeyError),

	#[error("failed to locate configuration directory")]
	NoConfigDir,
}

pub type Result<T> = std::result::Result<T, KeyFileError>;

/// Reads a private key in `wg genkey` format (base64, surrounding whitespace ignored).
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn load_private_key(path: impl AsRef<Path>) -> Result<WgKeyPair> {
	let content = zeroize::Zeroizing::new(fs::read_to_string(path.as_ref()).await?);
	let private = WgPrivateKey::from_base64(content.trim())?;
	Ok(WgKeyPair::from_private_key(private))
}

/// Reads a private key from `var_name`, falling back to the file named by `{var_name}_FILE`.
#[instrument(skip(var_name), fields(var = %var_name))]
pub async fn load_private_key_env(var_name: &str) -> Result<Option<WgKeyPair>> {
	if let Ok(value) = std::env::var(var_name) {
		let value = zeroize::Zeroizing::new(value);
		let private = WgPrivateKey::from_base64(value.trim())?;
		return Ok(Some(WgKeyPair::from_private_key(private)));
	}

	let file_var = format!("{}_FILE", var_name);
	if let Ok(path) = std::env::var(&file_var) {
		return load_private_key(path).await.map(Some);
	}

	Ok(None)
}

/// Writes a private key readable only by the owner.
#[instrument(skip(key), fields(path = %path.as_ref().display()))]
pub async fn save_private_key(key: &WgKeyPair, path: impl AsRef<Path>) -> Result<()> {
	let path = path.as_ref();

	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await?;
	}

	let private_b64 = key.private_key().to_base64();
	let content = zeroize::Zeroizing::new(format!("{}\n", private_b64.as_str()));

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
		file.sync_all().await?;
	}

	#[cfg(not(unix))]
	{
		fs::write(path, content.as_bytes()).await?;
	}

	debug!(public_key = %key.public_key(), "private key written");
	Ok(())
}

/// Loads the key at `path`, generating and saving a new one if it does not exist.
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn get_or_create_private_key(path: impl AsRef<Path>) -> Result<WgKeyPair> {
	let path = path.as_ref();

	if fs::try_exists(path).await? {
		return load_private_key(path).await;
	}

	let keypair = WgKeyPair::generate();
	save_private_key(&keypair, path).await?;
	Ok(keypair)
}

/// `$XDG_CONFIG_HOME/loom/wgtunnel` or the platform equivalent.
pub fn default_key_dir() -> Result<PathBuf> {
	dirs::config_dir()
		.map(|d| d.join("loom").join("wgtunnel"))
		.ok_or(KeyFileError::NoConfigDir)
}
