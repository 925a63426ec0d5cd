// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Backend whose traffic is moved by hand.
//!
//! Published envelopes are recorded; inbound envelopes are supplied with
//! [`ManualBackend::inject`]. Useful for tests and for exchanging
//! descriptions out of band.

use crate::backend::{Backend, BackendConfig, BackendType, MessageHandler};
use crate::codec::Envelope;
use crate::description::SessionDescription;
use crate::error::{Result, SignalingError};
use crate::subscriptions::{Dispatch, SubscriptionRegistry};
use async_trait::async_trait;
use loom_wgtunnel_common::{KeyPair, WgPrivateKey};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Default)]
pub struct ManualBackend {
	subscriptions: SubscriptionRegistry,
	published: Mutex<Vec<Envelope>>,
	notify: Notify,
	fail_publish: AtomicBool,
	closed: AtomicBool,
}

impl ManualBackend {
	pub fn new(config: &BackendConfig) -> Self {
		config.notify_ready(BackendType::Manual);
		Self::default()
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(SignalingError::Closed);
		}
		Ok(())
	}

	/// Delivers an envelope as if it had arrived from the transport.
	pub fn inject(&self, envelope: &Envelope) -> Dispatch {
		self.subscriptions.dispatch(envelope)
	}

	pub fn published(&self) -> Vec<Envelope> {
		self.published
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.clone()
	}

	pub fn take_published(&self) -> Vec<Envelope> {
		std::mem::take(&mut *self.published.lock().unwrap_or_else(|e| e.into_inner()))
	}

	/// Waits until at least `count` envelopes have been published.
	pub async fn wait_for_published(&self, count: usize) -> Vec<Envelope> {
		loop {
			let notified = self.notify.notified();
			let published = self.published();
			if published.len() >= count {
				return published;
			}
			notified.await;
		}
	}

	/// Makes subsequent publishes fail with a transport error.
	pub fn set_fail_publish(&self, fail: bool) {
		self.fail_publish.store(fail, Ordering::Release);
	}

	pub fn subscriptions(&self) -> &SubscriptionRegistry {
		&self.subscriptions
	}
}

#[async_trait]
impl Backend for ManualBackend {
	async fn publish(&self, kp: &KeyPair, description: &SessionDescription) -> Result<()> {
		self.ensure_open()?;
		if self.fail_publish.load(Ordering::Acquire) {
			return Err(SignalingError::Transport("publish disabled".to_string()));
		}
		let envelope = Envelope::seal(description, kp)?;
		self.published
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.push(envelope);
		self.notify.notify_waiters();
		Ok(())
	}

	async fn subscribe(&self, kp: &KeyPair, handler: Arc<dyn MessageHandler>) -> Result<bool> {
		self.ensure_open()?;
		Ok(self.subscriptions.subscribe(kp, handler))
	}

	async fn subscribe_all(
		&self,
		ours: &WgPrivateKey,
		handler: Arc<dyn MessageHandler>,
	) -> Result<bool> {
		self.ensure_open()?;
		Ok(self.subscriptions.subscribe_all(ours, handler))
	}

	async fn unsubscribe(&self, kp: &KeyPair) -> Result<bool> {
		self.ensure_open()?;
		Ok(self.subscriptions.unsubscribe(kp))
	}

	async fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Err(SignalingError::Closed);
		}
		self.subscriptions.clear();
		Ok(())
	}

	fn backend_type(&self) -> BackendType {
		BackendType::Manual
	}
}
