// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The reconciliation loop.
//!
//! [`Daemon::run`] is the only writer of desired state. Every control
//! request, kernel change notification and periodic tick funnels through its
//! single `select!` and ends in [`Daemon::sync_all`], which brings the kernel
//! devices and endpoint discovery sessions in line with that state.

use crate::config::{DaemonConfig, InterfaceConfig, PeerConfig};
use crate::control::{
	ControlRequest, DaemonHandle, DaemonStatus, InterfaceStatus, REQUEST_CAPACITY,
};
use crate::error::{ConfigError, DaemonError, Result};
use crate::signals::{SignalEvent, Signals};
use crate::sources::ConfigLoader;
use crate::state::{desired_interfaces, peer_device_update, DesiredInterface, PeerDiff};
use crate::watcher;
use loom_wgtunnel_common::{get_or_create_private_key, WgKeyPair, WgPublicKey};
use loom_wgtunnel_epdisc::{
	Device, DeviceUpdate, EndpointDiscovery, Event, EventBus, IceAgentFactory, IceSettings,
	PeerUpdate, WebrtcAgentFactory, WireGuardDevice,
};
use loom_wgtunnel_signaling::{Backend, BackendRegistry, BackendType, MultiBackend, ReadyHandler};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

struct ManagedInterface {
	discovery: EndpointDiscovery,
	peers: BTreeMap<WgPublicKey, PeerConfig>,
	ice: IceSettings,
	listen_port: Option<u16>,
	adopted: bool,
}

pub struct Daemon {
	config: DaemonConfig,
	loader: Option<ConfigLoader>,
	device: Arc<dyn WireGuardDevice>,
	backend: Arc<MultiBackend>,
	agents: Arc<dyn IceAgentFactory>,
	events: EventBus,
	install_signals: bool,
	interfaces: BTreeMap<String, ManagedInterface>,
	requests_tx: mpsc::Sender<ControlRequest>,
	requests: mpsc::Receiver<ControlRequest>,
	shutdown_tx: Arc<watch::Sender<bool>>,
	shutdown_rx: watch::Receiver<bool>,
}

impl Daemon {
	/// Connects the configured signaling backends. Fails if none of them
	/// could be created.
	#[instrument(skip_all, fields(backends = config.backends.len()))]
	pub async fn new(
		config: DaemonConfig,
		registry: &BackendRegistry,
		device: Arc<dyn WireGuardDevice>,
	) -> Result<Self> {
		config.validate()?;

		let events = EventBus::default();
		let ready: ReadyHandler = {
			let events = events.clone();
			Arc::new(move |backend: BackendType| {
				info!(%backend, "signaling backend ready");
				events.publish(Event::BackendReady { backend });
			})
		};
		let backend = MultiBackend::connect(
			registry,
			&config.backends,
			config.community.clone(),
			vec![ready],
		)
		.await?;

		let (requests_tx, requests) = mpsc::channel(REQUEST_CAPACITY);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		Ok(Self {
			config,
			loader: None,
			device,
			backend: Arc::new(backend),
			agents: Arc::new(WebrtcAgentFactory::new()),
			events,
			install_signals: true,
			interfaces: BTreeMap::new(),
			requests_tx,
			requests,
			shutdown_tx: Arc::new(shutdown_tx),
			shutdown_rx,
		})
	}

	pub fn with_agent_factory(mut self, agents: Arc<dyn IceAgentFactory>) -> Self {
		self.agents = agents;
		self
	}

	/// Source used by `reload_config` and SIGHUP.
	pub fn with_loader(mut self, loader: ConfigLoader) -> Self {
		self.loader = Some(loader);
		self
	}

	/// Leaves OS signals to the caller.
	pub fn without_signals(mut self) -> Self {
		self.install_signals = false;
		self
	}

	pub fn handle(&self) -> DaemonHandle {
		DaemonHandle::new(
			self.requests_tx.clone(),
			self.shutdown_tx.clone(),
			self.events.clone(),
		)
	}

	pub fn events(&self) -> &EventBus {
		&self.events
	}

	pub fn config(&self) -> &DaemonConfig {
		&self.config
	}

	/// Runs until shutdown is requested or a termination signal arrives, then
	/// closes sessions, signaling backends and the device, in that order.
	#[instrument(skip(self))]
	pub async fn run(mut self) -> Result<()> {
		info!(
			backends = ?self.backend.backend_types(),
			interfaces = self.config.interfaces.len(),
			"starting endpoint discovery daemon"
		);

		let mut signals = if self.install_signals {
			Signals::install()?
		} else {
			Signals::disabled()
		};

		let (changes_tx, mut changes) = mpsc::channel(1);
		let mut watch_period = self.config.watch_interval();
		let mut watcher = watcher::spawn(
			self.device.clone(),
			watch_period,
			changes_tx.clone(),
			self.shutdown_rx.clone(),
		);

		if let Err(e) = self.sync_all().await {
			warn!(error = %e, "initial sync failed");
		}

		let mut ticker = sync_ticker(self.config.sync_interval());

		loop {
			tokio::select! {
				biased;

				_ = self.shutdown_rx.changed() => {
					if *self.shutdown_rx.borrow() {
						info!("shutdown requested");
						break;
					}
				}

				signal = signals.recv() => match signal {
					SignalEvent::Terminate => {
						info!("termination signal received");
						break;
					}
					SignalEvent::Reload => {
						info!("reload signal received");
						if let Err(e) = self.reload_config().await {
							error!(error = %e, "failed to reload configuration");
						}
					}
				},

				Some(request) = self.requests.recv() => {
					self.handle_request(request).await;
				}

				Some(()) = changes.recv() => {
					debug!("kernel interfaces changed");
					if let Err(e) = self.sync_all().await {
						warn!(error = %e, "sync after interface change failed");
					}
				}

				_ = ticker.tick() => {
					if let Err(e) = self.sync_all().await {
						warn!(error = %e, "periodic sync failed");
					}
				}
			}

			if ticker.period() != self.config.sync_interval() {
				ticker = sync_ticker(self.config.sync_interval());
			}
			if watch_period != self.config.watch_interval() {
				watch_period = self.config.watch_interval();
				watcher.abort();
				watcher = watcher::spawn(
					self.device.clone(),
					watch_period,
					changes_tx.clone(),
					self.shutdown_rx.clone(),
				);
			}
		}

		let _ = self.shutdown_tx.send(true);
		if let Err(e) = watcher.await {
			debug!(error = %e, "interface watcher ended abnormally");
		}
		self.teardown().await;
		info!("endpoint discovery daemon stopped");
		Ok(())
	}

	async fn teardown(&mut self) {
		let names: Vec<String> = self.interfaces.keys().cloned().collect();
		for name in names {
			self.close_interface(&name).await;
		}
		if let Err(e) = self.backend.close().await {
			warn!(error = %e, "failed to close signaling backends");
		}
		if let Err(e) = self.device.close().await {
			warn!(error = %e, "failed to close WireGuard device");
		}
	}

	async fn handle_request(&mut self, request: ControlRequest) {
		match request {
			ControlRequest::AddPeer {
				interface,
				peer,
				reply,
			} => {
				let _ = reply.send(self.add_peer(&interface, peer).await);
			}
			ControlRequest::RemovePeer {
				interface,
				peer,
				reply,
			} => {
				let _ = reply.send(self.remove_peer(&interface, &peer).await);
			}
			ControlRequest::RestartPeer {
				interface,
				peer,
				reply,
			} => {
				let _ = reply.send(self.restart_peer(&interface, &peer).await);
			}
			ControlRequest::Sync { reply } => {
				let _ = reply.send(self.sync_all().await);
			}
			ControlRequest::ReloadConfig { reply } => {
				let _ = reply.send(self.reload_config().await);
			}
			ControlRequest::SetConfig { config, reply } => {
				let result = match self.apply_config(*config) {
					Ok(()) => self.sync_all().await,
					Err(e) => Err(e),
				};
				let _ = reply.send(result);
			}
			ControlRequest::GetConfig { reply } => {
				let _ = reply.send(self.config.clone());
			}
			ControlRequest::Status { reply } => {
				let _ = reply.send(self.status().await);
			}
		}
	}

	/// Configuration entry for `name`. An adopted interface is turned into a
	/// configured one holding its current peers.
	fn config_entry(&mut self, name: &str) -> Result<&mut InterfaceConfig> {
		if !self.config.interfaces.contains_key(name) {
			let managed = self
				.interfaces
				.get(name)
				.ok_or_else(|| DaemonError::InterfaceNotFound(name.to_string()))?;
			let materialized = InterfaceConfig {
				peers: managed.peers.values().cloned().collect(),
				..InterfaceConfig::default()
			};
			self.config.interfaces.insert(name.to_string(), materialized);
		}
		self.config
			.interfaces
			.get_mut(name)
			.ok_or_else(|| DaemonError::InterfaceNotFound(name.to_string()))
	}

	async fn add_peer(&mut self, interface: &str, peer: PeerConfig) -> Result<bool> {
		let key = peer.public_key;
		let added = self.config_entry(interface)?.upsert_peer(peer);
		info!(interface, peer = %key, added, "peer set via control request");
		self.sync_all().await?;
		Ok(added)
	}

	async fn remove_peer(&mut self, interface: &str, peer: &WgPublicKey) -> Result<bool> {
		let removed = self.config_entry(interface)?.remove_peer(peer);
		info!(interface, %peer, removed, "peer removed via control request");
		self.sync_all().await?;
		Ok(removed)
	}

	async fn restart_peer(&self, interface: &str, peer: &WgPublicKey) -> Result<()> {
		let managed = self
			.interfaces
			.get(interface)
			.ok_or_else(|| DaemonError::InterfaceNotFound(interface.to_string()))?;
		managed.discovery.restart_peer(peer).await?;
		Ok(())
	}

	async fn reload_config(&mut self) -> Result<()> {
		let loader = self.loader.as_ref().ok_or(ConfigError::NoSource)?;
		let config = loader.load()?;
		self.apply_config(config)?;
		info!("configuration reloaded");
		self.sync_all().await
	}

	/// Replaces the desired configuration. Changes made through control
	/// requests since the last load are discarded.
	fn apply_config(&mut self, config: DaemonConfig) -> Result<()> {
		config.validate()?;
		if config.backends != self.config.backends || config.community != self.config.community {
			warn!("signaling backend changes take effect after a restart");
		}
		self.config = config;
		Ok(())
	}

	async fn status(&self) -> DaemonStatus {
		let mut interfaces = Vec::with_capacity(self.interfaces.len());
		for (name, managed) in &self.interfaces {
			interfaces.push(InterfaceStatus {
				name: name.clone(),
				public_key: *managed.discovery.public_key(),
				listen_port: managed.listen_port,
				adopted: managed.adopted,
				peers: managed.discovery.status().await,
			});
		}
		DaemonStatus { interfaces }
	}

	async fn read_kernel(&self) -> Result<BTreeMap<String, Device>> {
		let mut kernel = BTreeMap::new();
		for name in self.device.list().await? {
			match self.device.get(&name).await {
				Ok(device) => {
					kernel.insert(name, device);
				}
				Err(e) => debug!(interface = %name, error = %e, "failed to read interface"),
			}
		}
		Ok(kernel)
	}

	/// Reconciles every interface against configuration and kernel state.
	#[instrument(skip(self))]
	pub async fn sync_all(&mut self) -> Result<()> {
		let kernel = self.read_kernel().await?;
		let desired = desired_interfaces(&self.config, &kernel);

		let stale: Vec<String> = self
			.interfaces
			.keys()
			.filter(|name| !desired.contains_key(*name))
			.cloned()
			.collect();
		for name in stale {
			self.close_interface(&name).await;
		}

		for (name, want) in &desired {
			let Some(device) = kernel.get(name) else {
				continue;
			};
			if !self.interfaces.contains_key(name) {
				match self.open_interface(want, device).await {
					Ok(managed) => {
						info!(interface = %name, public_key = %managed.discovery.public_key(), adopted = want.adopted, "interface added");
						self.interfaces.insert(name.clone(), managed);
						self.events.publish(Event::InterfaceAdded {
							interface: name.clone(),
						});
					}
					Err(e) => {
						warn!(interface = %name, error = %e, "failed to start interface");
						self.warning(name, None, format!("failed to start interface: {e}"));
						continue;
					}
				}
			}
			if let Err(e) = self.sync_interface(want, device).await {
				warn!(interface = %name, error = %e, "failed to sync interface");
			}
		}
		debug!(interfaces = self.interfaces.len(), "sync complete");
		Ok(())
	}

	async fn open_interface(
		&self,
		want: &DesiredInterface,
		device: &Device,
	) -> Result<ManagedInterface> {
		let identity = self.identity(want, device).await?;
		let discovery = EndpointDiscovery::new(
			want.name.clone(),
			identity,
			want.ice.clone(),
			self.backend.clone(),
			self.agents.clone(),
			self.device.clone(),
			self.events.clone(),
		);
		Ok(ManagedInterface {
			discovery,
			peers: BTreeMap::new(),
			ice: want.ice.clone(),
			listen_port: want.config.listen_port.or(device.listen_port),
			adopted: want.adopted,
		})
	}

	/// The configured key file wins and is pushed to the device; otherwise
	/// the key already on the device is used.
	async fn identity(&self, want: &DesiredInterface, device: &Device) -> Result<WgKeyPair> {
		if let Some(path) = &want.config.private_key_file {
			let keys = get_or_create_private_key(path).await?;
			if device.private_key.as_ref() != Some(keys.private_key()) {
				let update = DeviceUpdate {
					private_key: Some(keys.private_key().clone()),
					..DeviceUpdate::default()
				};
				self.device.set(&want.name, update).await?;
				info!(interface = %want.name, public_key = %keys.public_key(), "installed private key");
			}
			return Ok(keys);
		}
		device
			.private_key
			.clone()
			.map(WgKeyPair::from_private_key)
			.ok_or_else(|| DaemonError::MissingPrivateKey(want.name.clone()))
	}

	async fn sync_interface(&mut self, want: &DesiredInterface, device: &Device) -> Result<()> {
		let name = want.name.as_str();
		let Some(managed) = self.interfaces.get_mut(name) else {
			return Ok(());
		};
		managed.adopted = want.adopted;

		let mut modified = false;
		if managed.ice != want.ice {
			managed.discovery.update_settings(want.ice.clone()).await?;
			managed.ice = want.ice.clone();
			modified = true;
		}
		if let Some(port) = want.config.listen_port {
			if device.listen_port != Some(port) {
				let update = DeviceUpdate {
					listen_port: Some(port),
					..DeviceUpdate::default()
				};
				self.device.set(name, update).await?;
				managed.listen_port = Some(port);
				modified = true;
			}
		}
		if modified {
			info!(interface = %name, "interface modified");
			self.events.publish(Event::InterfaceModified {
				interface: name.to_string(),
			});
		}

		let mut target = want.peers();
		if target.remove(managed.discovery.public_key()).is_some() {
			debug!(interface = %name, "skipping the interface's own key in peer list");
		}

		for peer in target.values() {
			let Some(update) = peer_device_update(peer, device.peer(&peer.public_key)) else {
				continue;
			};
			if let Err(e) = self.device.set(name, DeviceUpdate::peer(update)).await {
				warn!(interface = %name, peer = %peer.public_key, error = %e, "failed to configure peer");
				self.events.publish(Event::Warning {
					interface: Some(name.to_string()),
					peer: Some(peer.public_key),
					message: format!("failed to configure peer: {e}"),
				});
			}
		}

		let diff = PeerDiff::between(&managed.peers, &target);
		for key in &diff.removed {
			if let Err(e) = managed.discovery.remove_peer(key).await {
				warn!(interface = %name, peer = %key, error = %e, "failed to stop peer session");
			}
			if device.peer(key).is_some() {
				if let Err(e) = self
					.device
					.set(name, DeviceUpdate::peer(PeerUpdate::remove(*key)))
					.await
				{
					warn!(interface = %name, peer = %key, error = %e, "failed to remove peer from device");
				}
			}
			self.backend.set_preference(*key, None);
			managed.peers.remove(key);
			info!(interface = %name, peer = %key, "peer removed");
			self.events.publish(Event::PeerRemoved {
				interface: name.to_string(),
				peer: *key,
			});
		}

		for peer in &diff.added {
			let key = peer.public_key;
			self.backend.set_preference(key, peer.backend);
			if !managed.discovery.add_peer(key).await? {
				continue;
			}
			managed.peers.insert(key, peer.clone());
			info!(interface = %name, peer = %key, "peer added");
			self.events.publish(Event::PeerAdded {
				interface: name.to_string(),
				peer: key,
			});
		}

		for peer in &diff.changed {
			let key = peer.public_key;
			self.backend.set_preference(key, peer.backend);
			managed.peers.insert(key, peer.clone());
			info!(interface = %name, peer = %key, "peer modified");
			self.events.publish(Event::PeerModified {
				interface: name.to_string(),
				peer: key,
			});
		}

		managed.discovery.sync(device).await?;
		Ok(())
	}

	async fn close_interface(&mut self, name: &str) {
		let Some(managed) = self.interfaces.remove(name) else {
			return;
		};
		for key in managed.peers.keys() {
			self.backend.set_preference(*key, None);
		}
		if let Err(e) = managed.discovery.close().await {
			warn!(interface = %name, error = %e, "failed to close endpoint discovery");
		}
		info!(interface = %name, "interface removed");
		self.events.publish(Event::InterfaceRemoved {
			interface: name.to_string(),
		});
	}

	fn warning(&self, interface: &str, peer: Option<WgPublicKey>, message: String) {
		self.events.publish(Event::Warning {
			interface: Some(interface.to_string()),
			peer,
			message,
		});
	}
}

fn sync_ticker(period: Duration) -> Interval {
	let mut ticker = interval_at(Instant::now() + period, period);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
	ticker
}
