// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WireGuard device collaborator.

use crate::error::DeviceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use loom_wgtunnel_common::{WgPrivateKey, WgPublicKey};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DevicePeer {
	pub public_key: WgPublicKey,
	pub endpoint: Option<SocketAddr>,
	pub allowed_ips: Vec<IpNet>,
	pub persistent_keepalive: Option<u16>,
	pub last_handshake: Option<DateTime<Utc>>,
}

impl DevicePeer {
	pub fn new(public_key: WgPublicKey) -> Self {
		Self {
			public_key,
			endpoint: None,
			allowed_ips: Vec::new(),
			persistent_keepalive: None,
			last_handshake: None,
		}
	}
}

/// Live state of one WireGuard interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
	pub name: String,
	#[serde(skip)]
	pub private_key: Option<WgPrivateKey>,
	pub public_key: Option<WgPublicKey>,
	pub listen_port: Option<u16>,
	pub peers: Vec<DevicePeer>,
}

impl Device {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			private_key: None,
			public_key: None,
			listen_port: None,
			peers: Vec::new(),
		}
	}

	pub fn peer(&self, key: &WgPublicKey) -> Option<&DevicePeer> {
		self.peers.iter().find(|p| &p.public_key == key)
	}
}

/// Change to one peer. `None` fields are left as they are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
	pub public_key: WgPublicKey,
	pub remove: bool,
	pub endpoint: Option<SocketAddr>,
	pub allowed_ips: Option<Vec<IpNet>>,
	pub persistent_keepalive: Option<u16>,
}

impl PeerUpdate {
	pub fn new(public_key: WgPublicKey) -> Self {
		Self {
			public_key,
			remove: false,
			endpoint: None,
			allowed_ips: None,
			persistent_keepalive: None,
		}
	}

	pub fn endpoint(public_key: WgPublicKey, endpoint: SocketAddr) -> Self {
		Self {
			endpoint: Some(endpoint),
			..Self::new(public_key)
		}
	}

	pub fn remove(public_key: WgPublicKey) -> Self {
		Self {
			remove: true,
			..Self::new(public_key)
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceUpdate {
	pub private_key: Option<WgPrivateKey>,
	pub listen_port: Option<u16>,
	pub peers: Vec<PeerUpdate>,
}

impl DeviceUpdate {
	pub fn peer(update: PeerUpdate) -> Self {
		Self {
			peers: vec![update],
			..Self::default()
		}
	}

	pub fn is_empty(&self) -> bool {
		self.private_key.is_none() && self.listen_port.is_none() && self.peers.is_empty()
	}
}

#[async_trait]
pub trait WireGuardDevice: Send + Sync {
	async fn list(&self) -> Result<Vec<String>, DeviceError>;

	async fn get(&self, name: &str) -> Result<Device, DeviceError>;

	async fn set(&self, name: &str, update: DeviceUpdate) -> Result<(), DeviceError>;

	async fn close(&self) -> Result<(), DeviceError> {
		Ok(())
	}
}

/// In-memory device for tests and userspace setups.
///
/// Every `set` call is recorded, including rejected ones.
#[derive(Default)]
pub struct MemoryDevice {
	devices: Mutex<BTreeMap<String, Device>>,
	updates: Mutex<Vec<(String, DeviceUpdate)>>,
	fail_set: AtomicBool,
}

impl MemoryDevice {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_interface(&self, device: Device) {
		self.devices
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(device.name.clone(), device);
	}

	pub fn remove_interface(&self, name: &str) -> Option<Device> {
		self.devices
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.remove(name)
	}

	/// Adds or replaces a peer without recording an update, as an external
	/// tool would.
	pub fn put_peer(&self, name: &str, peer: DevicePeer) -> Result<(), DeviceError> {
		let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
		let device = devices
			.get_mut(name)
			.ok_or_else(|| DeviceError::NotFound(name.to_string()))?;
		device.peers.retain(|p| p.public_key != peer.public_key);
		device.peers.push(peer);
		Ok(())
	}

	pub fn updates(&self) -> Vec<(String, DeviceUpdate)> {
		self.updates.lock().unwrap_or_else(|e| e.into_inner()).clone()
	}

	/// Endpoints set for `peer` on `name`, in call order.
	pub fn endpoint_updates(&self, name: &str, peer: &WgPublicKey) -> Vec<SocketAddr> {
		self.updates()
			.iter()
			.filter(|(interface, _)| interface == name)
			.flat_map(|(_, update)| update.peers.clone())
			.filter(|p| &p.public_key == peer)
			.filter_map(|p| p.endpoint)
			.collect()
	}

	pub fn set_fail_set(&self, fail: bool) {
		self.fail_set.store(fail, Ordering::Release);
	}
}

fn apply_peer(device: &mut Device, update: &PeerUpdate) {
	if update.remove {
		device.peers.retain(|p| p.public_key != update.public_key);
		return;
	}
	let index = match device
		.peers
		.iter()
		.position(|p| p.public_key == update.public_key)
	{
		Some(index) => index,
		None => {
			device.peers.push(DevicePeer::new(update.public_key));
			device.peers.len() - 1
		}
	};
	let peer = &mut device.peers[index];
	if let Some(endpoint) = update.endpoint {
		peer.endpoint = Some(endpoint);
	}
	if let Some(allowed_ips) = &update.allowed_ips {
		peer.allowed_ips = allowed_ips.clone();
	}
	if let Some(keepalive) = update.persistent_keepalive {
		peer.persistent_keepalive = (keepalive > 0).then_some(keepalive);
	}
}

#[async_trait]
impl WireGuardDevice for MemoryDevice {
	async fn list(&self) -> Result<Vec<String>, DeviceError> {
		Ok(self
			.devices
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.keys()
			.cloned()
			.collect())
	}

	async fn get(&self, name: &str) -> Result<Device, DeviceError> {
		self.devices
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.get(name)
			.cloned()
			.ok_or_else(|| DeviceError::NotFound(name.to_string()))
	}

	async fn set(&self, name: &str, update: DeviceUpdate) -> Result<(), DeviceError> {
		self.updates
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.push((name.to_string(), update.clone()));
		if self.fail_set.load(Ordering::Acquire) {
			return Err(DeviceError::Rejected("set disabled".to_string()));
		}

		let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
		let device = devices
			.get_mut(name)
			.ok_or_else(|| DeviceError::NotFound(name.to_string()))?;
		if let Some(private_key) = &update.private_key {
			device.public_key = Some(private_key.public_key());
			device.private_key = Some(private_key.clone());
		}
		if let Some(port) = update.listen_port {
			device.listen_port = Some(port);
		}
		for peer in &update.peers {
			apply_peer(device, peer);
		}
		Ok(())
	}
}
