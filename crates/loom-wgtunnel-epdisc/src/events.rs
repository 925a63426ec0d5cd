// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Event bus with one bounded queue per subscriber.
//!
//! Publishing never waits: a subscriber whose queue is full misses the event
//! and nobody else is affected.

use crate::status::ConnectionState;
use loom_wgtunnel_common::WgPublicKey;
use loom_wgtunnel_signaling::BackendType;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::warn;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
	PeerStateChanged {
		interface: String,
		peer: WgPublicKey,
		old: ConnectionState,
		new: ConnectionState,
		restarts: u32,
	},
	PeerAdded {
		interface: String,
		peer: WgPublicKey,
	},
	PeerRemoved {
		interface: String,
		peer: WgPublicKey,
	},
	PeerModified {
		interface: String,
		peer: WgPublicKey,
	},
	InterfaceAdded {
		interface: String,
	},
	InterfaceRemoved {
		interface: String,
	},
	InterfaceModified {
		interface: String,
	},
	BackendReady {
		backend: BackendType,
	},
	Warning {
		#[serde(skip_serializing_if = "Option::is_none")]
		interface: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		peer: Option<WgPublicKey>,
		message: String,
	},
}

struct BusInner {
	capacity: usize,
	next_id: AtomicU64,
	subscribers: Mutex<HashMap<u64, mpsc::Sender<Event>>>,
}

#[derive(Clone)]
pub struct EventBus {
	inner: Arc<BusInner>,
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(DEFAULT_CAPACITY)
	}
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		Self {
			inner: Arc::new(BusInner {
				capacity: capacity.max(1),
				next_id: AtomicU64::new(0),
				subscribers: Mutex::new(HashMap::new()),
			}),
		}
	}

	pub fn subscribe(&self) -> EventSubscription {
		let (tx, rx) = mpsc::channel(self.inner.capacity);
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		self.inner
			.subscribers
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(id, tx);
		EventSubscription {
			id,
			rx,
			bus: Arc::downgrade(&self.inner),
		}
	}

	/// Returns how many subscribers received the event.
	pub fn publish(&self, event: Event) -> usize {
		let mut subscribers = self
			.inner
			.subscribers
			.lock()
			.unwrap_or_else(|e| e.into_inner());
		let mut delivered = 0;
		subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
			Ok(()) => {
				delivered += 1;
				true
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				warn!(subscriber = id, "event subscriber is lagging, dropping event");
				true
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		});
		delivered
	}

	pub fn subscriber_count(&self) -> usize {
		self.inner
			.subscribers
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.len()
	}
}

impl std::fmt::Debug for EventBus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventBus")
			.field("capacity", &self.inner.capacity)
			.field("subscribers", &self.subscriber_count())
			.finish()
	}
}

/// Receiving end of [`EventBus::subscribe`]. Dropping it unsubscribes.
pub struct EventSubscription {
	id: u64,
	rx: mpsc::Receiver<Event>,
	bus: Weak<BusInner>,
}

impl EventSubscription {
	/// Next event, or `None` once the bus is gone.
	pub async fn recv(&mut self) -> Option<Event> {
		self.rx.recv().await
	}

	pub fn try_recv(&mut self) -> Option<Event> {
		self.rx.try_recv().ok()
	}
}

impl Drop for EventSubscription {
	fn drop(&mut self) {
		if let Some(bus) = self.bus.upgrade() {
			bus.subscribers
				.lock()
				.unwrap_or_else(|e| e.into_inner())
				.remove(&self.id);
		}
	}
}
