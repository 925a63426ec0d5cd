// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WireGuard key material.
//!
//! Keys are 32 bytes and use the same padded base64 text form as `wg genkey`
//! and `wg pubkey`. Unpadded input is accepted when parsing.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

pub const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("invalid key length: expected 32 bytes, got {0}")]
	InvalidLength(usize),

	#[error("invalid base64 encoding: {0}")]
	InvalidBase64(#[from] base64::DecodeError),

	#[error("invalid hex encoding: {0}")]
	InvalidHex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, KeyError>;

fn decode_base64(s: &str) -> Result<Zeroizing<Vec<u8>>> {
	let s = s.trim();
	let bytes = match STANDARD.decode(s) {
		Ok(bytes) => bytes,
		Err(_) => STANDARD_NO_PAD.decode(s)?,
	};
	Ok(Zeroizing::new(bytes))
}

fn to_array(bytes: &[u8]) -> Result<[u8; KEY_LEN]> {
	if bytes.len() != KEY_LEN {
		return Err(KeyError::InvalidLength(bytes.len()));
	}
	let mut arr = [0u8; KEY_LEN];
	arr.copy_from_slice(bytes);
	Ok(arr)
}

/// Applies the X25519 scalar clamping that `wg genkey` performs.
fn clamp(bytes: &mut [u8; KEY_LEN]) {
	bytes[0] &= 248;
	bytes[31] &= 127;
	bytes[31] |= 64;
}

#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct WgPrivateKey {
	bytes: [u8; KEY_LEN],
}

impl WgPrivateKey {
	/// Generates a clamped private key from the OS random source.
	pub fn generate() -> Self {
		let mut bytes = StaticSecret::random_from_rng(OsRng).to_bytes();
		clamp(&mut bytes);
		Self { bytes }
	}

	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		let bytes = decode_base64(s)?;
		Ok(Self {
			bytes: to_array(&bytes)?,
		})
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		let bytes = Zeroizing::new(hex::decode(s.trim())?);
		Ok(Self {
			bytes: to_array(&bytes)?,
		})
	}

	pub fn to_base64(&self) -> Zeroizing<String> {
		Zeroizing::new(STANDARD.encode(self.bytes))
	}

	pub fn public_key(&self) -> WgPublicKey {
		let secret = StaticSecret::from(self.bytes);
		WgPublicKey {
			bytes: *PublicKey::from(&secret).as_bytes(),
		}
	}

	pub fn expose_bytes(&self) -> &[u8; KEY_LEN] {
		&self.bytes
	}

	pub(crate) fn diffie_hellman(&self, theirs: &WgPublicKey) -> [u8; KEY_LEN] {
		let secret = StaticSecret::from(self.bytes);
		secret
			.diffie_hellman(&PublicKey::from(theirs.bytes))
			.to_bytes()
	}
}

impl PartialEq for WgPrivateKey {
	fn eq(&self, other: &Self) -> bool {
		self.bytes
			.iter()
			.zip(other.bytes.iter())
			.fold(0u8, |acc, (a, b)| acc | (a ^ b))
			== 0
	}
}

impl Eq for WgPrivateKey {}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgPrivateKey")
			.field("bytes", &"[REDACTED]")
			.finish()
	}
}

impl fmt::Display for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("[REDACTED]")
	}
}

impl Serialize for WgPrivateKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str("[REDACTED]")
	}
}

impl<'de> Deserialize<'de> for WgPrivateKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = Zeroizing::new(String::deserialize(deserializer)?);
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WgPublicKey {
	bytes: [u8; KEY_LEN],
}

impl WgPublicKey {
	/// The all-zero key. Never a valid peer identity.
	pub const ZERO: WgPublicKey = WgPublicKey {
		bytes: [0u8; KEY_LEN],
	};

	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self { bytes }
	}

	pub fn from_slice(bytes: &[u8]) -> Result<Self> {
		Ok(Self {
			bytes: to_array(bytes)?,
		})
	}

	/// Random 32 bytes, unclamped. Used for pre-shared keys and tests.
	pub fn random() -> Self {
		let mut bytes = [0u8; KEY_LEN];
		OsRng.fill_bytes(&mut bytes);
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		let bytes = decode_base64(s)?;
		Ok(Self {
			bytes: to_array(&bytes)?,
		})
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		let bytes = hex::decode(s.trim())?;
		Ok(Self {
			bytes: to_array(&bytes)?,
		})
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.bytes)
	}

	pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
		&self.bytes
	}

	pub fn is_zero(&self) -> bool {
		self.bytes == [0u8; KEY_LEN]
	}

	/// Short form for log lines.
	pub fn short(&self) -> String {
		let b64 = self.to_base64();
		b64.chars().take(8).collect()
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgPublicKey")
			.field("prefix", &format!("{}...", self.short()))
			.finish()
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl FromStr for WgPublicKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self> {
		Self::from_base64(s)
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_base64())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

/// A local WireGuard identity: a private key and its derived public key.
#[derive(Clone, PartialEq, Eq)]
pub struct WgKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl WgKeyPair {
	pub fn generate() -> Self {
		Self::from_private_key(WgPrivateKey::generate())
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn from_base64(private_key_base64: &str) -> Result<Self> {
		let private = WgPrivateKey::from_base64(private_key_base64)?;
		Ok(Self::from_private_key(private))
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}

	/// Pairs this identity with a remote peer's public key.
	pub fn pair_with(&self, theirs: WgPublicKey) -> crate::pair::KeyPair {
		crate::pair::KeyPair::new(self.private.clone(), theirs)
	}

	/// The side whose public key sorts higher drives connectivity checks.
	pub fn is_controlling(&self, theirs: &WgPublicKey) -> bool {
		self.public.cmp(theirs) == Ordering::Greater
	}
}

impl fmt::Debug for WgKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgKeyPair")
			.field("private", &self.private)
			.field("public", &self.public)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn generated_key_is_clamped() {
		let private = WgPrivateKey::generate();
		let bytes = private.expose_bytes();
		assert_eq!(bytes[0] & 7, 0);
		assert_eq!(bytes[31] & 128, 0);
		assert_eq!(bytes[31] & 64, 64);
	}

	#[test]
	fn base64_matches_wg_text_form() {
		let keypair = WgKeyPair::generate();
		let b64 = keypair.public_key().to_base64();
		assert_eq!(b64.len(), 44);
		assert!(b64.ends_with('='));
	}

	#[test]
	fn base64_roundtrip() {
		let keypair = WgKeyPair::generate();
		let private_b64 = keypair.private_key().to_base64();
		let restored = WgKeyPair::from_base64(&private_b64).unwrap();
		assert_eq!(keypair.public_key(), restored.public_key());
	}

	#[test]
	fn unpadded_base64_is_accepted() {
		let keypair = WgKeyPair::generate();
		let padded = keypair.public_key().to_base64();
		let unpadded = padded.trim_end_matches('=');
		let restored = WgPublicKey::from_base64(unpadded).unwrap();
		assert_eq!(keypair.public_key(), &restored);
	}

	#[test]
	fn wrong_length_is_rejected() {
		let short = STANDARD.encode([1u8; 16]);
		assert!(matches!(
			WgPublicKey::from_base64(&short),
			Err(KeyError::InvalidLength(16))
		));
		assert!(matches!(
			WgPublicKey::from_slice(&[0u8; 33]),
			Err(KeyError::InvalidLength(33))
		));
	}

	#[test]
	fn known_public_key_derivation() {
		// RFC 7748 section 6.1 test vector (Alice).
		let private =
			WgPrivateKey::from_hex("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
				.unwrap();
		assert_eq!(
			private.public_key().to_hex(),
			"8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"
		);
	}

	#[test]
	fn controlling_role_is_asymmetric() {
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		assert_ne!(
			a.is_controlling(b.public_key()),
			b.is_controlling(a.public_key())
		);
	}

	#[test]
	fn private_key_display_is_redacted() {
		let private = WgPrivateKey::generate();
		assert_eq!(format!("{}", private), "[REDACTED]");
	}

	#[test]
	fn public_key_serialize_deserialize() {
		let keypair = WgKeyPair::generate();
		let json = serde_json::to_string(keypair.public_key()).unwrap();
		let restored: WgPublicKey = serde_json::from_str(&json).unwrap();
		assert_eq!(keypair.public_key(), &restored);
	}

	#[test]
	fn zero_key() {
		assert!(WgPublicKey::ZERO.is_zero());
		assert!(!WgKeyPair::generate().public_key().is_zero());
	}

	proptest! {
		#[test]
		fn private_key_debug_never_leaks(seed in prop::array::uniform32(any::<u8>())) {
			let private = WgPrivateKey::from_bytes(seed);
			let debug = format!("{:?}", private);
			prop_assert!(!debug.contains(&STANDARD.encode(seed)));
			prop_assert!(!debug.contains(&hex::encode(seed)));
			prop_assert!(debug.contains("[REDACTED]"));
		}

		#[test]
		fn private_key_serialize_never_leaks(seed in prop::array::uniform32(any::<u8>())) {
			let private = WgPrivateKey::from_bytes(seed);
			let json = serde_json::to_string(&private).unwrap();
			prop_assert!(!json.contains(&STANDARD.encode(seed)));
			prop_assert!(json.contains("[REDACTED]"));
		}

		#[test]
		fn public_key_text_roundtrip(seed in prop::array::uniform32(any::<u8>())) {
			let public = WgPublicKey::from_bytes(seed);
			let parsed: WgPublicKey = public.to_string().parse().unwrap();
			prop_assert_eq!(public, parsed);
		}
	}
}
