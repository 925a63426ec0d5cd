// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Key pairs addressing a signaling channel between two peers.

use crate::keys::{WgPrivateKey, WgPublicKey, KEY_LEN};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

const CHANNEL_CONTEXT: &[u8] = b"loom-wgtunnel-channel";
const TOPIC_CONTEXT: &[u8] = b"loom-wgtunnel-topic";

/// Our private key plus the remote peer's public key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
	pub ours: WgPrivateKey,
	pub theirs: WgPublicKey,
}

impl KeyPair {
	pub fn new(ours: WgPrivateKey, theirs: WgPublicKey) -> Self {
		Self { ours, theirs }
	}

	pub fn public(&self) -> PublicKeyPair {
		PublicKeyPair {
			ours: self.ours.public_key(),
			theirs: self.theirs,
		}
	}

	/// X25519 shared secret. `shared(a, B) == shared(b, A)`.
	pub fn shared(&self) -> SharedSecret {
		SharedSecret {
			bytes: self.ours.diffie_hellman(&self.theirs),
		}
	}

	pub fn channel(&self) -> ChannelId {
		self.shared().channel()
	}
}

impl fmt::Debug for KeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KeyPair")
			.field("ours", &self.ours)
			.field("theirs", &self.theirs)
			.finish()
	}
}

/// Public-only projection of a [`KeyPair`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyPair {
	pub ours: WgPublicKey,
	pub theirs: WgPublicKey,
}

impl PublicKeyPair {
	pub fn new(ours: WgPublicKey, theirs: WgPublicKey) -> Self {
		Self { ours, theirs }
	}

	pub fn swapped(&self) -> Self {
		Self {
			ours: self.theirs,
			theirs: self.ours,
		}
	}

	/// Order-independent topic name for transports that route without
	/// private keys. Not an authentication mechanism.
	pub fn channel(&self) -> ChannelId {
		let (lo, hi) = if self.ours <= self.theirs {
			(self.ours, self.theirs)
		} else {
			(self.theirs, self.ours)
		};
		let mut hasher = Sha256::new();
		hasher.update(TOPIC_CONTEXT);
		hasher.update(lo.as_bytes());
		hasher.update(hi.as_bytes());
		ChannelId(hasher.finalize().into())
	}
}

#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
	bytes: [u8; KEY_LEN],
}

impl SharedSecret {
	pub fn expose_bytes(&self) -> &[u8; KEY_LEN] {
		&self.bytes
	}

	pub fn channel(&self) -> ChannelId {
		let mut input = Zeroizing::new(Vec::with_capacity(CHANNEL_CONTEXT.len() + KEY_LEN));
		input.extend_from_slice(CHANNEL_CONTEXT);
		input.extend_from_slice(&self.bytes);
		ChannelId(Sha256::digest(input.as_slice()).into())
	}
}

impl PartialEq for SharedSecret {
	fn eq(&self, other: &Self) -> bool {
		self.bytes
			.iter()
			.zip(other.bytes.iter())
			.fold(0u8, |acc, (a, b)| acc | (a ^ b))
			== 0
	}
}

impl fmt::Debug for SharedSecret {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SharedSecret([REDACTED])")
	}
}

/// Channel identifier two peers derive identically.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId([u8; 32]);

impl ChannelId {
	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}

	/// First `len` hex characters, for size-limited names.
	pub fn short_hex(&self, len: usize) -> String {
		let mut hex = self.to_hex();
		hex.truncate(len);
		hex
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_hex())
	}
}

impl fmt::Debug for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ChannelId({})", self.short_hex(16))
	}
}
