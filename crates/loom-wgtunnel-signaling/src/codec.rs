// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Sealing session descriptions into envelopes.
//!
//! Envelopes are NaCl boxes (X25519, XSalsa20-Poly1305) keyed by the sender's
//! private key and the recipient's public key. Successful decryption is the
//! only proof of the sender's identity.

use crate::description::SessionDescription;
use crate::error::CodecError;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use loom_wgtunnel_common::{KeyPair, PublicKeyPair, WgPublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub const NONCE_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
	pub sender: WgPublicKey,
	pub recipient: WgPublicKey,
	#[serde(with = "base64_bytes")]
	pub nonce: Vec<u8>,
	#[serde(with = "base64_bytes")]
	pub ciphertext: Vec<u8>,
}

fn salsa_box(kp: &KeyPair) -> SalsaBox {
	let theirs = PublicKey::from(*kp.theirs.as_bytes());
	let ours = SecretKey::from(*kp.ours.expose_bytes());
	SalsaBox::new(&theirs, &ours)
}

impl Envelope {
	/// Encrypts `description` from `kp.ours` to `kp.theirs` under a fresh nonce.
	pub fn seal(description: &SessionDescription, kp: &KeyPair) -> Result<Self, CodecError> {
		let plaintext =
			Zeroizing::new(serde_json::to_vec(description).map_err(CodecError::Encode)?);

		let mut nonce = [0u8; NONCE_LEN];
		OsRng.fill_bytes(&mut nonce);

		let ciphertext = salsa_box(kp)
			.encrypt(GenericArray::from_slice(&nonce), plaintext.as_slice())
			.map_err(|_| CodecError::EncryptFailed)?;

		let public = kp.public();
		Ok(Self {
			sender: public.ours,
			recipient: public.theirs,
			nonce: nonce.to_vec(),
			ciphertext,
		})
	}

	/// Decrypts an envelope sent by `kp.theirs` to `kp.ours`.
	pub fn open(&self, kp: &KeyPair) -> Result<SessionDescription, CodecError> {
		if self.nonce.len() != NONCE_LEN {
			return Err(CodecError::InvalidNonce(self.nonce.len()));
		}
		if self.public_key_pair() != kp.public() {
			return Err(CodecError::KeyPairMismatch);
		}

		let plaintext = Zeroizing::new(
			salsa_box(kp)
				.decrypt(GenericArray::from_slice(&self.nonce), self.ciphertext.as_slice())
				.map_err(|_| CodecError::DecryptFailed)?,
		);

		serde_json::from_slice(&plaintext).map_err(CodecError::Decode)
	}

	/// The key pair as seen by the recipient: ours is the recipient.
	pub fn public_key_pair(&self) -> PublicKeyPair {
		PublicKeyPair::new(self.recipient, self.sender)
	}

	pub fn to_json(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}

	pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
		serde_json::from_str(s)
	}
}

mod base64_bytes {
	use base64::engine::general_purpose::STANDARD;
	use base64::Engine;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		STANDARD.decode(s).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::candidate::{Candidate, CandidateKind, NetworkType};
	use crate::description::Credentials;
	use loom_wgtunnel_common::{WgKeyPair, WgPrivateKey};
	use proptest::prelude::*;

	fn description(epoch: u64) -> SessionDescription {
		SessionDescription::new(
			epoch,
			Credentials::new("ufragufrag", "passwordpasswordpassword"),
			vec![Candidate {
				kind: CandidateKind::Host,
				foundation: "1".to_string(),
				component: 1,
				network_type: NetworkType::Udp4,
				priority: 2130706431,
				address: "10.0.0.5".to_string(),
				port: 51820,
				tcp_type: None,
				related_address: None,
			}],
		)
	}

	#[test]
	fn seal_open_roundtrip() {
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let desc = description(1);

		let envelope = Envelope::seal(&desc, &a.pair_with(*b.public_key())).unwrap();
		assert_eq!(&envelope.sender, a.public_key());
		assert_eq!(&envelope.recipient, b.public_key());
		assert_eq!(envelope.nonce.len(), NONCE_LEN);

		let opened = envelope.open(&b.pair_with(*a.public_key())).unwrap();
		assert_eq!(opened, desc);
	}

	#[test]
	fn nonces_are_fresh() {
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let kp = a.pair_with(*b.public_key());
		let first = Envelope::seal(&description(1), &kp).unwrap();
		let second = Envelope::seal(&description(1), &kp).unwrap();
		assert_ne!(first.nonce, second.nonce);
		assert_ne!(first.ciphertext, second.ciphertext);
	}

	#[test]
	fn wrong_nonce_length_is_rejected() {
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let mut envelope = Envelope::seal(&description(1), &a.pair_with(*b.public_key())).unwrap();
		envelope.nonce.truncate(12);
		assert!(matches!(
			envelope.open(&b.pair_with(*a.public_key())),
			Err(CodecError::InvalidNonce(12))
		));
	}

	#[test]
	fn third_party_cannot_open() {
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let eve = WgKeyPair::generate();
		let envelope = Envelope::seal(&description(1), &a.pair_with(*b.public_key())).unwrap();

		assert!(matches!(
			envelope.open(&eve.pair_with(*a.public_key())),
			Err(CodecError::KeyPairMismatch)
		));
	}

	#[test]
	fn forged_sender_fails_authentication() {
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let eve = WgKeyPair::generate();

		// Eve claims to be `a` but can only seal with her own key.
		let mut envelope =
			Envelope::seal(&description(1), &eve.pair_with(*b.public_key())).unwrap();
		envelope.sender = *a.public_key();

		assert!(matches!(
			envelope.open(&b.pair_with(*a.public_key())),
			Err(CodecError::DecryptFailed)
		));
	}

	#[test]
	fn json_wire_form() {
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let envelope = Envelope::seal(&description(7), &a.pair_with(*b.public_key())).unwrap();
		let json = envelope.to_json().unwrap();
		assert!(json.contains(&a.public_key().to_base64()));
		let restored = Envelope::from_json(&json).unwrap();
		assert_eq!(restored, envelope);
	}

	proptest! {
		#[test]
		fn roundtrip_for_any_keys_and_epoch(
			a in prop::array::uniform32(any::<u8>()),
			b in prop::array::uniform32(any::<u8>()),
			epoch in any::<u64>(),
			need_reply in any::<bool>(),
		) {
			let a = WgKeyPair::from_private_key(WgPrivateKey::from_bytes(a));
			let b = WgKeyPair::from_private_key(WgPrivateKey::from_bytes(b));
			let desc = description(epoch).with_need_reply(need_reply);
			let envelope = Envelope::seal(&desc, &a.pair_with(*b.public_key())).unwrap();
			let opened = envelope.open(&b.pair_with(*a.public_key())).unwrap();
			prop_assert_eq!(opened, desc);
		}

		#[test]
		fn any_single_bit_flip_is_rejected(bit in any::<prop::sample::Index>()) {
			let a = WgKeyPair::generate();
			let b = WgKeyPair::generate();
			let mut envelope = Envelope::seal(&description(3), &a.pair_with(*b.public_key())).unwrap();
			let total_bits = envelope.ciphertext.len() * 8;
			let i = bit.index(total_bits);
			envelope.ciphertext[i / 8] ^= 1 << (i % 8);
			prop_assert!(matches!(
				envelope.open(&b.pair_with(*a.public_key())),
				Err(CodecError::DecryptFailed)
			));
		}

		#[test]
		fn nonce_bit_flip_is_rejected(bit in 0usize..(NONCE_LEN * 8)) {
			let a = WgKeyPair::generate();
			let b = WgKeyPair::generate();
			let mut envelope = Envelope::seal(&description(3), &a.pair_with(*b.public_key())).unwrap();
			envelope.nonce[bit / 8] ^= 1 << (bit % 8);
			prop_assert!(envelope.open(&b.pair_with(*a.public_key())).is_err());
		}
	}
}
