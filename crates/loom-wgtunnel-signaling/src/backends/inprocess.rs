// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Backend connecting instances that live in the same process.

use crate::backend::{Backend, BackendConfig, BackendType, MessageHandler};
use crate::codec::Envelope;
use crate::description::SessionDescription;
use crate::error::{Result, SignalingError};
use crate::subscriptions::{Dispatch, SubscriptionRegistry};
use async_trait::async_trait;
use loom_wgtunnel_common::{KeyPair, WgPrivateKey};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

/// Routes envelopes between every [`InProcessBackend`] attached to it.
#[derive(Default)]
pub struct InProcessHub {
	next_id: AtomicU64,
	members: Mutex<Vec<(u64, Arc<SubscriptionRegistry>)>>,
}

impl InProcessHub {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	fn attach(&self, registry: Arc<SubscriptionRegistry>) -> u64 {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
		members.push((id, registry));
		id
	}

	fn detach(&self, id: u64) {
		let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
		members.retain(|(member, _)| *member != id);
	}

	/// Delivers `envelope` to every attached instance. Returns the number of
	/// handlers that received it.
	pub fn route(&self, envelope: &Envelope) -> usize {
		let members: Vec<Arc<SubscriptionRegistry>> = {
			let members = self.members.lock().unwrap_or_else(|e| e.into_inner());
			members.iter().map(|(_, r)| r.clone()).collect()
		};
		members
			.iter()
			.map(|registry| match registry.dispatch(envelope) {
				Dispatch::Delivered(n) => n,
				_ => 0,
			})
			.sum()
	}

	pub fn member_count(&self) -> usize {
		self.members.lock().unwrap_or_else(|e| e.into_inner()).len()
	}
}

pub struct InProcessBackend {
	id: u64,
	hub: Arc<InProcessHub>,
	subscriptions: Arc<SubscriptionRegistry>,
	closed: AtomicBool,
}

impl InProcessBackend {
	pub fn new(hub: Arc<InProcessHub>, config: &BackendConfig) -> Self {
		let subscriptions = Arc::new(SubscriptionRegistry::new());
		let id = hub.attach(subscriptions.clone());
		config.notify_ready(BackendType::Inprocess);
		Self {
			id,
			hub,
			subscriptions,
			closed: AtomicBool::new(false),
		}
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(SignalingError::Closed);
		}
		Ok(())
	}
}

#[async_trait]
impl Backend for InProcessBackend {
	#[instrument(skip_all, fields(peer = %kp.theirs, epoch = description.epoch))]
	async fn publish(&self, kp: &KeyPair, description: &SessionDescription) -> Result<()> {
		self.ensure_open()?;
		let envelope = Envelope::seal(description, kp)?;
		let delivered = self.hub.route(&envelope);
		debug!(delivered, "routed envelope");
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
		self.hub.detach(self.id);
		self.subscriptions.clear();
		Ok(())
	}

	fn backend_type(&self) -> BackendType {
		BackendType::Inprocess
	}
}

impl Drop for InProcessBackend {
	fn drop(&mut self) {
		self.hub.detach(self.id);
	}
}
