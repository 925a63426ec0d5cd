// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared key material for WireGuard endpoint discovery.
//!
//! Peers are identified by their WireGuard public keys. The same X25519 keys
//! authenticate signaling messages, and both sides of a pair derive the same
//! [`ChannelId`] without revealing which side initiated.

pub mod backoff;
pub mod keys;
pub mod keys_file;
pub mod pair;

pub use backoff::Backoff;
pub use keys::{KeyError, WgKeyPair, WgPrivateKey, WgPublicKey, KEY_LEN};
pub use keys_file::{
	default_key_dir, get_or_create_private_key, load_private_key, load_private_key_env,
	save_private_key, KeyFileError,
};
pub use pair::{ChannelId, KeyPair, PublicKeyPair, SharedSecret};
