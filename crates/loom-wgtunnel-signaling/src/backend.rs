// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::description::SessionDescription;
use crate::error::Result;
use async_trait::async_trait;
use loom_wgtunnel_common::{KeyPair, PublicKeyPair, WgPrivateKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
	Inprocess,
	Manual,
	Relay,
	Mcast,
	K8s,
	Multi,
}

impl BackendType {
	pub fn as_str(&self) -> &'static str {
		match self {
			BackendType::Inprocess => "inprocess",
			BackendType::Manual => "manual",
			BackendType::Relay => "relay",
			BackendType::Mcast => "mcast",
			BackendType::K8s => "k8s",
			BackendType::Multi => "multi",
		}
	}
}

impl fmt::Display for BackendType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for BackendType {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s {
			"inprocess" => Ok(BackendType::Inprocess),
			"manual" => Ok(BackendType::Manual),
			"relay" => Ok(BackendType::Relay),
			"mcast" => Ok(BackendType::Mcast),
			"k8s" => Ok(BackendType::K8s),
			"multi" => Ok(BackendType::Multi),
			other => Err(format!("unknown backend type: {}", other)),
		}
	}
}

/// Receives decrypted session descriptions.
///
/// Called from backend receive workers; implementations must not block.
pub trait MessageHandler: Send + Sync {
	fn on_message(&self, pair: &PublicKeyPair, description: SessionDescription);
}

/// One decrypted message. `pair.ours` is the recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
	pub pair: PublicKeyPair,
	pub description: SessionDescription,
}

/// Forwards messages into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
	tx: mpsc::Sender<Inbound>,
}

impl ChannelHandler {
	pub fn new(tx: mpsc::Sender<Inbound>) -> Self {
		Self { tx }
	}

	pub fn channel(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Inbound>) {
		let (tx, rx) = mpsc::channel(capacity);
		(Arc::new(Self { tx }), rx)
	}
}

impl MessageHandler for ChannelHandler {
	fn on_message(&self, pair: &PublicKeyPair, description: SessionDescription) {
		let inbound = Inbound {
			pair: *pair,
			description,
		};
		if let Err(mpsc::error::TrySendError::Full(dropped)) = self.tx.try_send(inbound) {
			warn!(
				peer = %dropped.pair.theirs,
				epoch = dropped.description.epoch,
				"signaling inbox full, dropping description"
			);
		}
	}
}

/// Callback fired once a backend can carry traffic.
pub type ReadyHandler = Arc<dyn Fn(BackendType) + Send + Sync>;

/// Parameters a backend is constructed from.
#[derive(Clone)]
pub struct BackendConfig {
	pub uri: Url,
	/// Optional group identifier; backends sharing a medium ignore traffic
	/// from other communities.
	pub community: Option<String>,
	pub on_ready: Vec<ReadyHandler>,
}

impl BackendConfig {
	pub fn new(uri: Url) -> Self {
		Self {
			uri,
			community: None,
			on_ready: Vec::new(),
		}
	}

	pub fn with_community(mut self, community: impl Into<String>) -> Self {
		self.community = Some(community.into());
		self
	}

	pub fn with_ready_handler(mut self, handler: ReadyHandler) -> Self {
		self.on_ready.push(handler);
		self
	}

	pub fn notify_ready(&self, backend_type: BackendType) {
		for handler in &self.on_ready {
			handler(backend_type);
		}
	}

	pub fn query(&self, name: &str) -> Option<String> {
		self.uri
			.query_pairs()
			.find(|(k, _)| k == name)
			.map(|(_, v)| v.into_owned())
	}

	pub fn query_bool(&self, name: &str) -> std::result::Result<Option<bool>, String> {
		match self.query(name).as_deref() {
			None => Ok(None),
			Some("" | "1" | "true" | "yes") => Ok(Some(true)),
			Some("0" | "false" | "no") => Ok(Some(false)),
			Some(other) => Err(format!("{}: expected boolean, got {}", name, other)),
		}
	}
}

impl fmt::Debug for BackendConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BackendConfig")
			.field("uri", &self.uri.as_str())
			.field("community", &self.community)
			.field("on_ready", &self.on_ready.len())
			.finish()
	}
}

/// An encrypted signaling transport.
///
/// Every call fails with [`SignalingError::Closed`](crate::SignalingError::Closed)
/// after [`Backend::close`]. Callers cancel in-flight calls by dropping the
/// future.
#[async_trait]
pub trait Backend: Send + Sync {
	/// Seals `description` and sends it to `kp.theirs`.
	async fn publish(&self, kp: &KeyPair, description: &SessionDescription) -> Result<()>;

	/// Delivers descriptions sent by `kp.theirs` to `kp.ours`. Returns true if
	/// this was the first subscription for our key on this backend.
	async fn subscribe(&self, kp: &KeyPair, handler: Arc<dyn MessageHandler>) -> Result<bool>;

	/// Delivers descriptions addressed to `ours` from any sender.
	async fn subscribe_all(
		&self,
		ours: &WgPrivateKey,
		handler: Arc<dyn MessageHandler>,
	) -> Result<bool>;

	/// Removes the handlers registered for `kp`. Returns true if `kp.ours`
	/// has no subscriptions left.
	async fn unsubscribe(&self, kp: &KeyPair) -> Result<bool>;

	async fn close(&self) -> Result<()>;

	fn backend_type(&self) -> BackendType;
}
