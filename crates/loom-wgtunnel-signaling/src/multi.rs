// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fan-out over several backends.
//!
//! Publishing uses a single backend per peer. Subscriptions are registered
//! with every backend and deduplicated on `(sender, epoch)` so a description
//! relayed by more than one transport reaches the caller once.

use crate::backend::{Backend, BackendConfig, BackendType, MessageHandler, ReadyHandler};
use crate::description::SessionDescription;
use crate::error::{Result, SignalingError};
use crate::registry::BackendRegistry;
use async_trait::async_trait;
use loom_wgtunnel_common::{KeyPair, PublicKeyPair, WgPrivateKey, WgPublicKey};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument, warn};
use url::Url;

/// Epochs remembered per sender.
const DEDUP_WINDOW: usize = 32;

struct DedupHandler {
	inner: Arc<dyn MessageHandler>,
	seen: Mutex<HashMap<WgPublicKey, VecDeque<u64>>>,
}

impl DedupHandler {
	fn new(inner: Arc<dyn MessageHandler>) -> Self {
		Self {
			inner,
			seen: Mutex::new(HashMap::new()),
		}
	}

	/// Records `(sender, epoch)`; returns false if it was already seen.
	fn first_sighting(&self, sender: WgPublicKey, epoch: u64) -> bool {
		let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
		let epochs = seen.entry(sender).or_default();
		if epochs.contains(&epoch) {
			return false;
		}
		if epochs.len() == DEDUP_WINDOW {
			epochs.pop_front();
		}
		epochs.push_back(epoch);
		true
	}
}

impl MessageHandler for DedupHandler {
	fn on_message(&self, pair: &PublicKeyPair, description: SessionDescription) {
		if !self.first_sighting(pair.theirs, description.epoch) {
			debug!(peer = %pair.theirs, epoch = description.epoch, "dropping duplicate description");
			return;
		}
		self.inner.on_message(pair, description);
	}
}

pub struct MultiBackend {
	backends: Vec<Arc<dyn Backend>>,
	preferences: Mutex<HashMap<WgPublicKey, BackendType>>,
	closed: AtomicBool,
}

impl MultiBackend {
	pub fn new(backends: Vec<Arc<dyn Backend>>) -> Result<Self> {
		if backends.is_empty() {
			return Err(SignalingError::NoBackends);
		}
		Ok(Self {
			backends,
			preferences: Mutex::new(HashMap::new()),
			closed: AtomicBool::new(false),
		})
	}

	/// Creates one backend per URL. URLs that fail to parse or connect are
	/// logged and skipped.
	#[instrument(skip_all, fields(count = urls.len()))]
	pub async fn connect(
		registry: &BackendRegistry,
		urls: &[String],
		community: Option<String>,
		on_ready: Vec<ReadyHandler>,
	) -> Result<Self> {
		let mut backends = Vec::with_capacity(urls.len());
		for raw in urls {
			let uri = match Url::parse(raw) {
				Ok(uri) => uri,
				Err(e) => {
					warn!(url = %raw, error = %e, "skipping invalid backend URL");
					continue;
				}
			};
			let config = BackendConfig {
				uri,
				community: community.clone(),
				on_ready: on_ready.clone(),
			};
			match registry.create(config).await {
				Ok(backend) => {
					debug!(url = %raw, backend = %backend.backend_type(), "signaling backend created");
					backends.push(backend);
				}
				Err(e) => warn!(url = %raw, error = %e, "skipping signaling backend"),
			}
		}
		Self::new(backends)
	}

	pub fn backends(&self) -> &[Arc<dyn Backend>] {
		&self.backends
	}

	pub fn backend_types(&self) -> Vec<BackendType> {
		self.backends.iter().map(|b| b.backend_type()).collect()
	}

	pub fn by_type(&self, backend_type: BackendType) -> Option<&Arc<dyn Backend>> {
		self.backends
			.iter()
			.find(|b| b.backend_type() == backend_type)
	}

	/// Routes publishes for `peer` to the given backend type, or to the first
	/// backend when `None`.
	pub fn set_preference(&self, peer: WgPublicKey, backend_type: Option<BackendType>) {
		let mut preferences = self.preferences.lock().unwrap_or_else(|e| e.into_inner());
		match backend_type {
			Some(t) => preferences.insert(peer, t),
			None => preferences.remove(&peer),
		};
	}

	fn publisher_for(&self, peer: &WgPublicKey) -> &Arc<dyn Backend> {
		let preferred = self
			.preferences
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.get(peer)
			.copied();
		preferred
			.and_then(|t| self.by_type(t))
			.unwrap_or(&self.backends[0])
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(SignalingError::Closed);
		}
		Ok(())
	}
}

/// Folds per-backend outcomes: succeeds if any backend succeeded.
fn any_ok(results: Vec<Result<bool>>, combine: fn(bool, bool) -> bool, init: bool) -> Result<bool> {
	let mut value = None;
	let mut first_err = None;
	for result in results {
		match result {
			Ok(v) => value = Some(combine(value.unwrap_or(init), v)),
			Err(e) => {
				warn!(error = %e, "signaling backend call failed");
				first_err.get_or_insert(e);
			}
		}
	}
	match (value, first_err) {
		(Some(v), _) => Ok(v),
		(None, Some(e)) => Err(e),
		(None, None) => Ok(init),
	}
}

#[async_trait]
impl Backend for MultiBackend {
	async fn publish(&self, kp: &KeyPair, description: &SessionDescription) -> Result<()> {
		self.ensure_open()?;
		self.publisher_for(&kp.theirs).publish(kp, description).await
	}

	async fn subscribe(&self, kp: &KeyPair, handler: Arc<dyn MessageHandler>) -> Result<bool> {
		self.ensure_open()?;
		let handler: Arc<dyn MessageHandler> = Arc::new(DedupHandler::new(handler));
		let mut results = Vec::with_capacity(self.backends.len());
		for backend in &self.backends {
			results.push(backend.subscribe(kp, handler.clone()).await);
		}
		any_ok(results, |a, b| a || b, false)
	}

	async fn subscribe_all(
		&self,
		ours: &WgPrivateKey,
		handler: Arc<dyn MessageHandler>,
	) -> Result<bool> {
		self.ensure_open()?;
		let handler: Arc<dyn MessageHandler> = Arc::new(DedupHandler::new(handler));
		let mut results = Vec::with_capacity(self.backends.len());
		for backend in &self.backends {
			results.push(backend.subscribe_all(ours, handler.clone()).await);
		}
		any_ok(results, |a, b| a || b, false)
	}

	async fn unsubscribe(&self, kp: &KeyPair) -> Result<bool> {
		self.ensure_open()?;
		let mut results = Vec::with_capacity(self.backends.len());
		for backend in &self.backends {
			results.push(backend.unsubscribe(kp).await);
		}
		any_ok(results, |a, b| a && b, true)
	}

	async fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Err(SignalingError::Closed);
		}
		let mut first_err = None;
		for backend in &self.backends {
			if let Err(e) = backend.close().await {
				warn!(backend = %backend.backend_type(), error = %e, "failed to close signaling backend");
				first_err.get_or_insert(e);
			}
		}
		match first_err {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	fn backend_type(&self) -> BackendType {
		BackendType::Multi
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::ChannelHandler;
	use crate::backends::inprocess::{InProcessBackend, InProcessHub};
	use crate::backends::manual::ManualBackend;
	use crate::description::Credentials;
	use loom_wgtunnel_common::WgKeyPair;

	fn manual() -> Arc<ManualBackend> {
		Arc::new(ManualBackend::default())
	}

	fn desc(epoch: u64) -> SessionDescription {
		SessionDescription::new(epoch, Credentials::generate(), vec![])
	}

	#[test]
	fn empty_is_rejected() {
		assert!(matches!(
			MultiBackend::new(Vec::new()),
			Err(SignalingError::NoBackends)
		));
	}

	#[tokio::test]
	async fn publish_uses_first_backend_by_default() {
		let first = manual();
		let hub = InProcessHub::new();
		let second: Arc<dyn Backend> = Arc::new(InProcessBackend::new(
			hub,
			&BackendConfig::new(Url::parse("inprocess://").unwrap()),
		));
		let multi = MultiBackend::new(vec![first.clone() as Arc<dyn Backend>, second]).unwrap();

		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		multi
			.publish(&a.pair_with(*b.public_key()), &desc(1))
			.await
			.unwrap();
		assert_eq!(first.published().len(), 1);
	}

	#[tokio::test]
	async fn publish_honours_preference() {
		let hub = InProcessHub::new();
		let inprocess: Arc<dyn Backend> = Arc::new(InProcessBackend::new(
			hub,
			&BackendConfig::new(Url::parse("inprocess://").unwrap()),
		));
		let recorder = manual();
		let multi = MultiBackend::new(vec![inprocess, recorder.clone() as Arc<dyn Backend>]).unwrap();

		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let kp = a.pair_with(*b.public_key());

		multi.publish(&kp, &desc(1)).await.unwrap();
		assert!(recorder.published().is_empty());

		multi.set_preference(*b.public_key(), Some(BackendType::Manual));
		multi.publish(&kp, &desc(2)).await.unwrap();
		assert_eq!(recorder.published().len(), 1);

		multi.set_preference(*b.public_key(), None);
		multi.publish(&kp, &desc(3)).await.unwrap();
		assert_eq!(recorder.published().len(), 1);
	}

	#[tokio::test]
	async fn duplicate_deliveries_are_merged() {
		let one = manual();
		let two = manual();
		let multi = MultiBackend::new(vec![one.clone() as Arc<dyn Backend>, two.clone()]).unwrap();

		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let (handler, mut rx) = ChannelHandler::channel(8);
		assert!(multi
			.subscribe(&b.pair_with(*a.public_key()), handler)
			.await
			.unwrap());

		let sender = a.pair_with(*b.public_key());
		let envelope = crate::codec::Envelope::seal(&desc(5), &sender).unwrap();
		one.inject(&envelope);
		two.inject(&envelope);
		let newer = crate::codec::Envelope::seal(&desc(6), &sender).unwrap();
		two.inject(&newer);

		assert_eq!(rx.recv().await.unwrap().description.epoch, 5);
		assert_eq!(rx.recv().await.unwrap().description.epoch, 6);
		assert!(rx.try_recv().is_err());
	}

	#[test]
	fn dedup_window_is_bounded() {
		let (handler, _rx) = ChannelHandler::channel(1);
		let dedup = DedupHandler::new(handler);
		let sender = WgPublicKey::random();
		for epoch in 0..(DEDUP_WINDOW as u64 + 10) {
			assert!(dedup.first_sighting(sender, epoch));
		}
		assert_eq!(dedup.seen.lock().unwrap()[&sender].len(), DEDUP_WINDOW);
		assert!(!dedup.first_sighting(sender, DEDUP_WINDOW as u64 + 9));
	}

	#[tokio::test]
	async fn close_closes_every_member_and_reports_first_error() {
		let one = manual();
		let two = manual();
		two.close().await.unwrap();
		let multi = MultiBackend::new(vec![one.clone() as Arc<dyn Backend>, two]).unwrap();

		assert!(matches!(multi.close().await, Err(SignalingError::Closed)));
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		assert!(matches!(
			one.publish(&a.pair_with(*b.public_key()), &desc(1)).await,
			Err(SignalingError::Closed)
		));
		assert!(matches!(
			multi.publish(&a.pair_with(*b.public_key()), &desc(1)).await,
			Err(SignalingError::Closed)
		));
	}

	#[tokio::test]
	async fn subscribe_survives_partial_failure() {
		let one = manual();
		let broken = manual();
		broken.close().await.unwrap();
		let multi = MultiBackend::new(vec![broken as Arc<dyn Backend>, one.clone()]).unwrap();

		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let (handler, _rx) = ChannelHandler::channel(1);
		assert!(multi
			.subscribe(&b.pair_with(*a.public_key()), handler)
			.await
			.unwrap());
		assert!(one.subscriptions().is_subscribed(b.public_key()));
	}

	#[tokio::test]
	async fn connect_skips_bad_urls() {
		let registry = BackendRegistry::with_defaults();
		let urls = vec![
			"not a url".to_string(),
			"grpc://localhost:1".to_string(),
			"inprocess://".to_string(),
		];
		let multi = MultiBackend::connect(&registry, &urls, None, Vec::new())
			.await
			.unwrap();
		assert_eq!(multi.backend_types(), vec![BackendType::Inprocess]);

		let none = MultiBackend::connect(&registry, &urls[..2], None, Vec::new()).await;
		assert!(matches!(none, Err(SignalingError::NoBackends)));
	}
}
