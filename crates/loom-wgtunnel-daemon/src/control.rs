// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Control requests and the handle used to submit them.

use crate::config::{DaemonConfig, PeerConfig};
use crate::error::{DaemonError, Result};
use loom_wgtunnel_common::WgPublicKey;
use loom_wgtunnel_epdisc::{EventBus, EventSubscription, PeerStatus};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

pub const REQUEST_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceStatus {
	pub name: String,
	pub public_key: WgPublicKey,
	pub listen_port: Option<u16>,
	pub adopted: bool,
	pub peers: Vec<PeerStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStatus {
	pub interfaces: Vec<InterfaceStatus>,
}

impl DaemonStatus {
	pub fn interface(&self, name: &str) -> Option<&InterfaceStatus> {
		self.interfaces.iter().find(|i| i.name == name)
	}
}

pub(crate) enum ControlRequest {
	AddPeer {
		interface: String,
		peer: PeerConfig,
		reply: oneshot::Sender<Result<bool>>,
	},
	RemovePeer {
		interface: String,
		peer: WgPublicKey,
		reply: oneshot::Sender<Result<bool>>,
	},
	RestartPeer {
		interface: String,
		peer: WgPublicKey,
		reply: oneshot::Sender<Result<()>>,
	},
	Sync {
		reply: oneshot::Sender<Result<()>>,
	},
	ReloadConfig {
		reply: oneshot::Sender<Result<()>>,
	},
	SetConfig {
		config: Box<DaemonConfig>,
		reply: oneshot::Sender<Result<()>>,
	},
	GetConfig {
		reply: oneshot::Sender<DaemonConfig>,
	},
	Status {
		reply: oneshot::Sender<DaemonStatus>,
	},
}

/// Cloneable handle to a running [`Daemon`](crate::Daemon).
///
/// Every request is queued to the daemon loop and answered once the loop has
/// handled it. Requests fail with [`DaemonError::NotRunning`] after the loop
/// has exited.
#[derive(Clone)]
pub struct DaemonHandle {
	requests: mpsc::Sender<ControlRequest>,
	shutdown: Arc<watch::Sender<bool>>,
	events: EventBus,
}

impl DaemonHandle {
	pub(crate) fn new(
		requests: mpsc::Sender<ControlRequest>,
		shutdown: Arc<watch::Sender<bool>>,
		events: EventBus,
	) -> Self {
		Self {
			requests,
			shutdown,
			events,
		}
	}

	async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ControlRequest) -> Result<T> {
		let (tx, rx) = oneshot::channel();
		self.requests
			.send(build(tx))
			.await
			.map_err(|_| DaemonError::NotRunning)?;
		rx.await.map_err(|_| DaemonError::NotRunning)
	}

	/// Adds or updates a peer. Returns true if the peer is new.
	pub async fn add_peer(&self, interface: impl Into<String>, peer: PeerConfig) -> Result<bool> {
		let interface = interface.into();
		self.call(|reply| ControlRequest::AddPeer {
			interface,
			peer,
			reply,
		})
		.await?
	}

	pub async fn remove_peer(&self, interface: impl Into<String>, peer: WgPublicKey) -> Result<bool> {
		let interface = interface.into();
		self.call(|reply| ControlRequest::RemovePeer {
			interface,
			peer,
			reply,
		})
		.await?
	}

	pub async fn restart_peer(&self, interface: impl Into<String>, peer: WgPublicKey) -> Result<()> {
		let interface = interface.into();
		self.call(|reply| ControlRequest::RestartPeer {
			interface,
			peer,
			reply,
		})
		.await?
	}

	pub async fn sync(&self) -> Result<()> {
		self.call(|reply| ControlRequest::Sync { reply }).await?
	}

	pub async fn reload_config(&self) -> Result<()> {
		self.call(|reply| ControlRequest::ReloadConfig { reply }).await?
	}

	pub async fn set_config(&self, config: DaemonConfig) -> Result<()> {
		self.call(|reply| ControlRequest::SetConfig {
			config: Box::new(config),
			reply,
		})
		.await?
	}

	pub async fn get_config(&self) -> Result<DaemonConfig> {
		self.call(|reply| ControlRequest::GetConfig { reply }).await
	}

	pub async fn status(&self) -> Result<DaemonStatus> {
		self.call(|reply| ControlRequest::Status { reply }).await
	}

	/// Asks the daemon loop to exit. Returns immediately.
	pub fn shutdown(&self) {
		let _ = self.shutdown.send(true);
	}

	pub fn subscribe_events(&self) -> EventSubscription {
		self.events.subscribe()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn requests_fail_once_the_loop_is_gone() {
		let (tx, rx) = mpsc::channel(REQUEST_CAPACITY);
		let (shutdown, _) = watch::channel(false);
		let handle = DaemonHandle::new(tx, Arc::new(shutdown), EventBus::default());
		drop(rx);
		assert!(matches!(handle.sync().await, Err(DaemonError::NotRunning)));
		assert!(matches!(handle.status().await, Err(DaemonError::NotRunning)));
	}

	#[test]
	fn status_serializes_for_clients() {
		let key = WgPublicKey::random();
		let status = DaemonStatus {
			interfaces: vec![InterfaceStatus {
				name: "wg0".to_string(),
				public_key: key,
				listen_port: Some(51820),
				adopted: false,
				peers: vec![PeerStatus::new("wg0", WgPublicKey::random())],
			}],
		};
		let json = serde_json::to_value(&status).unwrap();
		assert_eq!(json["interfaces"][0]["name"], "wg0");
		assert_eq!(json["interfaces"][0]["public_key"], key.to_base64());
		assert_eq!(json["interfaces"][0]["peers"][0]["state"], "new");
		assert!(status.interface("wg1").is_none());
	}

	#[tokio::test]
	async fn unanswered_requests_report_not_running() {
		let (tx, mut rx) = mpsc::channel(REQUEST_CAPACITY);
		let (shutdown, _) = watch::channel(false);
		let handle = DaemonHandle::new(tx, Arc::new(shutdown), EventBus::default());
		let pending = tokio::spawn({
			let handle = handle.clone();
			async move { handle.get_config().await }
		});
		drop(rx.recv().await);
		assert!(matches!(pending.await.unwrap(), Err(DaemonError::NotRunning)));
	}
}
