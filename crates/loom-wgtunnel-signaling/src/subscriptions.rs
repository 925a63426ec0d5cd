// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Handler bookkeeping shared by backend implementations.

use crate::backend::MessageHandler;
use crate::codec::Envelope;
use crate::error::CodecError;
use loom_wgtunnel_common::{KeyPair, WgPrivateKey, WgPublicKey};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

struct Subscription {
	key: WgPrivateKey,
	by_sender: HashMap<WgPublicKey, Vec<Arc<dyn MessageHandler>>>,
	catch_all: Vec<Arc<dyn MessageHandler>>,
}

impl Subscription {
	fn new(key: WgPrivateKey) -> Self {
		Self {
			key,
			by_sender: HashMap::new(),
			catch_all: Vec::new(),
		}
	}

	fn is_empty(&self) -> bool {
		self.by_sender.is_empty() && self.catch_all.is_empty()
	}
}

/// Outcome of routing one inbound envelope.
#[derive(Debug)]
pub enum Dispatch {
	/// Not addressed to any subscribed key.
	NotSubscribed,
	/// Decrypted and handed to this many handlers.
	Delivered(usize),
	/// Addressed to us but rejected by the codec.
	Rejected(CodecError),
}

/// Maps recipient public keys to their private key and handlers.
#[derive(Default)]
pub struct SubscriptionRegistry {
	subs: RwLock<HashMap<WgPublicKey, Subscription>>,
}

impl SubscriptionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns true if this is the first subscription for `kp.ours`.
	pub fn subscribe(&self, kp: &KeyPair, handler: Arc<dyn MessageHandler>) -> bool {
		let ours = kp.ours.public_key();
		let mut subs = self.subs.write().unwrap_or_else(|e| e.into_inner());
		let first = !subs.contains_key(&ours);
		subs.entry(ours)
			.or_insert_with(|| Subscription::new(kp.ours.clone()))
			.by_sender
			.entry(kp.theirs)
			.or_default()
			.push(handler);
		first
	}

	/// Registers a handler for messages to `ours` from any sender.
	pub fn subscribe_all(&self, ours: &WgPrivateKey, handler: Arc<dyn MessageHandler>) -> bool {
		let public = ours.public_key();
		let mut subs = self.subs.write().unwrap_or_else(|e| e.into_inner());
		let first = !subs.contains_key(&public);
		subs.entry(public)
			.or_insert_with(|| Subscription::new(ours.clone()))
			.catch_all
			.push(handler);
		first
	}

	/// Returns true if `kp.ours` no longer has any handlers.
	pub fn unsubscribe(&self, kp: &KeyPair) -> bool {
		let ours = kp.ours.public_key();
		let mut subs = self.subs.write().unwrap_or_else(|e| e.into_inner());
		let Some(sub) = subs.get_mut(&ours) else {
			return true;
		};
		sub.by_sender.remove(&kp.theirs);
		if sub.is_empty() {
			subs.remove(&ours);
			return true;
		}
		false
	}

	pub fn recipients(&self) -> Vec<WgPublicKey> {
		let subs = self.subs.read().unwrap_or_else(|e| e.into_inner());
		subs.keys().copied().collect()
	}

	pub fn is_subscribed(&self, recipient: &WgPublicKey) -> bool {
		let subs = self.subs.read().unwrap_or_else(|e| e.into_inner());
		subs.contains_key(recipient)
	}

	pub fn is_empty(&self) -> bool {
		let subs = self.subs.read().unwrap_or_else(|e| e.into_inner());
		subs.is_empty()
	}

	pub fn clear(&self) {
		let mut subs = self.subs.write().unwrap_or_else(|e| e.into_inner());
		subs.clear();
	}

	/// Decrypts `envelope` with the recipient's key and calls every handler
	/// registered for its sender plus the catch-all handlers.
	pub fn dispatch(&self, envelope: &Envelope) -> Dispatch {
		let (kp, handlers) = {
			let subs = self.subs.read().unwrap_or_else(|e| e.into_inner());
			let Some(sub) = subs.get(&envelope.recipient) else {
				return Dispatch::NotSubscribed;
			};
			let mut handlers: Vec<Arc<dyn MessageHandler>> = sub
				.by_sender
				.get(&envelope.sender)
				.cloned()
				.unwrap_or_default();
			handlers.extend(sub.catch_all.iter().cloned());
			(KeyPair::new(sub.key.clone(), envelope.sender), handlers)
		};

		if handlers.is_empty() {
			return Dispatch::NotSubscribed;
		}

		let description = match envelope.open(&kp) {
			Ok(description) => description,
			Err(e) => {
				debug!(
					sender = %envelope.sender,
					recipient = %envelope.recipient,
					error = %e,
					"dropping envelope"
				);
				return Dispatch::Rejected(e);
			}
		};

		let pair = envelope.public_key_pair();
		for handler in &handlers {
			handler.on_message(&pair, description.clone());
		}
		Dispatch::Delivered(handlers.len())
	}
}

impl std::fmt::Debug for SubscriptionRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SubscriptionRegistry")
			.field("recipients", &self.recipients().len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::ChannelHandler;
	use crate::description::{Credentials, SessionDescription};
	use loom_wgtunnel_common::WgKeyPair;

	fn desc(epoch: u64) -> SessionDescription {
		SessionDescription::new(epoch, Credentials::generate(), vec![])
	}

	#[test]
	fn first_subscription_is_reported() {
		let registry = SubscriptionRegistry::new();
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let c = WgKeyPair::generate();
		let (handler, _rx) = ChannelHandler::channel(4);

		assert!(registry.subscribe(&a.pair_with(*b.public_key()), handler.clone()));
		assert!(!registry.subscribe(&a.pair_with(*c.public_key()), handler));
		assert_eq!(registry.recipients(), vec![*a.public_key()]);
	}

	#[tokio::test]
	async fn dispatch_routes_by_sender() {
		let registry = SubscriptionRegistry::new();
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let c = WgKeyPair::generate();
		let (from_b, mut rx_b) = ChannelHandler::channel(4);
		let (from_c, mut rx_c) = ChannelHandler::channel(4);
		registry.subscribe(&a.pair_with(*b.public_key()), from_b);
		registry.subscribe(&a.pair_with(*c.public_key()), from_c);

		let envelope = Envelope::seal(&desc(9), &b.pair_with(*a.public_key())).unwrap();
		assert!(matches!(registry.dispatch(&envelope), Dispatch::Delivered(1)));

		let inbound = rx_b.recv().await.unwrap();
		assert_eq!(inbound.description.epoch, 9);
		assert_eq!(&inbound.pair.ours, a.public_key());
		assert_eq!(&inbound.pair.theirs, b.public_key());
		assert!(rx_c.try_recv().is_err());
	}

	#[tokio::test]
	async fn catch_all_receives_unknown_senders() {
		let registry = SubscriptionRegistry::new();
		let a = WgKeyPair::generate();
		let stranger = WgKeyPair::generate();
		let (handler, mut rx) = ChannelHandler::channel(4);
		assert!(registry.subscribe_all(a.private_key(), handler));

		let envelope = Envelope::seal(&desc(1), &stranger.pair_with(*a.public_key())).unwrap();
		assert!(matches!(registry.dispatch(&envelope), Dispatch::Delivered(1)));
		assert_eq!(&rx.recv().await.unwrap().pair.theirs, stranger.public_key());
	}

	#[test]
	fn unrelated_envelopes_are_ignored() {
		let registry = SubscriptionRegistry::new();
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let envelope = Envelope::seal(&desc(1), &a.pair_with(*b.public_key())).unwrap();
		assert!(matches!(registry.dispatch(&envelope), Dispatch::NotSubscribed));
	}

	#[test]
	fn tampered_envelope_is_rejected() {
		let registry = SubscriptionRegistry::new();
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let (handler, _rx) = ChannelHandler::channel(4);
		registry.subscribe(&a.pair_with(*b.public_key()), handler);

		let mut envelope = Envelope::seal(&desc(1), &b.pair_with(*a.public_key())).unwrap();
		envelope.ciphertext[0] ^= 1;
		assert!(matches!(
			registry.dispatch(&envelope),
			Dispatch::Rejected(CodecError::DecryptFailed)
		));
	}

	#[test]
	fn unsubscribe_removes_recipient_when_empty() {
		let registry = SubscriptionRegistry::new();
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let c = WgKeyPair::generate();
		let (handler, _rx) = ChannelHandler::channel(4);
		let ab = a.pair_with(*b.public_key());
		let ac = a.pair_with(*c.public_key());
		registry.subscribe(&ab, handler.clone());
		registry.subscribe(&ac, handler);

		assert!(!registry.unsubscribe(&ab));
		assert!(registry.is_subscribed(a.public_key()));
		assert!(registry.unsubscribe(&ac));
		assert!(registry.is_empty());
	}
}
