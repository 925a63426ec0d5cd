// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Endpoint discovery for one WireGuard interface.

use crate::device::{Device, WireGuardDevice};
use crate::error::{EpdiscError, Result};
use crate::events::EventBus;
use crate::ice::IceAgentFactory;
use crate::session::{SessionContext, SessionHandle};
use crate::settings::IceSettings;
use crate::status::PeerStatus;
use loom_wgtunnel_common::{WgKeyPair, WgPublicKey};
use loom_wgtunnel_signaling::Backend;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument};

struct Inner {
	settings: IceSettings,
	sessions: HashMap<WgPublicKey, SessionHandle>,
	closed: bool,
}

/// Owns one session per remote peer of an interface.
pub struct EndpointDiscovery {
	interface: String,
	identity: WgKeyPair,
	ctx: SessionContext,
	inner: Mutex<Inner>,
}

impl EndpointDiscovery {
	pub fn new(
		interface: impl Into<String>,
		identity: WgKeyPair,
		settings: IceSettings,
		backend: Arc<dyn Backend>,
		agents: Arc<dyn IceAgentFactory>,
		device: Arc<dyn WireGuardDevice>,
		events: EventBus,
	) -> Self {
		Self {
			interface: interface.into(),
			identity,
			ctx: SessionContext {
				backend,
				agents,
				device,
				events,
			},
			inner: Mutex::new(Inner {
				settings,
				sessions: HashMap::new(),
				closed: false,
			}),
		}
	}

	pub fn interface(&self) -> &str {
		&self.interface
	}

	pub fn public_key(&self) -> &WgPublicKey {
		self.identity.public_key()
	}

	/// Starts a session for `peer`. Returns false if one already exists.
	#[instrument(skip(self), fields(interface = %self.interface))]
	pub async fn add_peer(&self, peer: WgPublicKey) -> Result<bool> {
		let mut inner = self.inner.lock().await;
		if inner.closed {
			return Err(EpdiscError::Closed);
		}
		if inner.sessions.contains_key(&peer) {
			return Ok(false);
		}
		if &peer == self.identity.public_key() {
			debug!("ignoring own public key");
			return Ok(false);
		}
		let keys = self.identity.pair_with(peer);
		let handle = SessionHandle::spawn(
			self.interface.clone(),
			keys,
			inner.settings.clone(),
			self.ctx.clone(),
		);
		inner.sessions.insert(peer, handle);
		info!(%peer, "added peer");
		Ok(true)
	}

	/// Stops and removes the session for `peer`. Returns false if there was
	/// none.
	#[instrument(skip(self), fields(interface = %self.interface))]
	pub async fn remove_peer(&self, peer: &WgPublicKey) -> Result<bool> {
		let handle = self.inner.lock().await.sessions.remove(peer);
		let Some(handle) = handle else {
			return Ok(false);
		};
		handle.close().await?;
		info!(%peer, "removed peer");
		Ok(true)
	}

	pub async fn restart_peer(&self, peer: &WgPublicKey) -> Result<()> {
		let control = self
			.inner
			.lock()
			.await
			.sessions
			.get(peer)
			.map(SessionHandle::control)
			.ok_or(EpdiscError::PeerNotFound(*peer))?;
		control.restart().await
	}

	/// Replaces the settings used by current and future sessions.
	pub async fn update_settings(&self, settings: IceSettings) -> Result<()> {
		let controls: Vec<_> = {
			let mut inner = self.inner.lock().await;
			if inner.settings == settings {
				return Ok(());
			}
			inner.settings = settings.clone();
			inner.sessions.values().map(SessionHandle::control).collect()
		};
		for control in controls {
			control.update_settings(settings.clone()).await?;
		}
		Ok(())
	}

	pub async fn settings(&self) -> IceSettings {
		self.inner.lock().await.settings.clone()
	}

	pub async fn peers(&self) -> Vec<WgPublicKey> {
		let mut peers: Vec<_> = self.inner.lock().await.sessions.keys().copied().collect();
		peers.sort();
		peers
	}

	pub async fn status(&self) -> Vec<PeerStatus> {
		let mut status: Vec<_> = self
			.inner
			.lock()
			.await
			.sessions
			.values()
			.map(SessionHandle::status)
			.collect();
		status.sort_by(|a, b| a.peer.cmp(&b.peer));
		status
	}

	pub async fn peer_status(&self, peer: &WgPublicKey) -> Result<PeerStatus> {
		self.inner
			.lock()
			.await
			.sessions
			.get(peer)
			.map(SessionHandle::status)
			.ok_or(EpdiscError::PeerNotFound(*peer))
	}

	pub async fn watch_peer(&self, peer: &WgPublicKey) -> Result<watch::Receiver<PeerStatus>> {
		self.inner
			.lock()
			.await
			.sessions
			.get(peer)
			.map(SessionHandle::watch)
			.ok_or(EpdiscError::PeerNotFound(*peer))
	}

	/// Hands the live kernel view to each session so drifted endpoints are
	/// put back.
	pub async fn sync(&self, device: &Device) -> Result<()> {
		let controls: Vec<_> = self
			.inner
			.lock()
			.await
			.sessions
			.iter()
			.map(|(peer, handle)| (*peer, handle.control()))
			.collect();
		for (peer, control) in controls {
			let kernel_endpoint = device.peer(&peer).and_then(|p| p.endpoint);
			if let Err(e) = control.resync(kernel_endpoint).await {
				debug!(%peer, error = %e, "failed to resync peer");
			}
		}
		Ok(())
	}

	/// Stops every session. Later calls to `add_peer` fail.
	#[instrument(skip(self), fields(interface = %self.interface))]
	pub async fn close(&self) -> Result<()> {
		let handles: Vec<_> = {
			let mut inner = self.inner.lock().await;
			inner.closed = true;
			inner.sessions.drain().map(|(_, handle)| handle).collect()
		};
		let count = handles.len();
		for handle in handles {
			let _ = handle.close().await;
		}
		info!(sessions = count, "closed endpoint discovery");
		Ok(())
	}
}
