// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Desired state derived from configuration and the live kernel view.

use crate::config::{DaemonConfig, InterfaceConfig, PeerConfig};
use loom_wgtunnel_common::WgPublicKey;
use loom_wgtunnel_epdisc::{Device, DevicePeer, IceSettings, PeerUpdate};
use std::collections::BTreeMap;
use tracing::debug;

/// What one interface should look like after a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredInterface {
	pub name: String,
	pub config: InterfaceConfig,
	pub ice: IceSettings,
	/// Present in the kernel and matched by the interface filter, but not
	/// configured.
	pub adopted: bool,
}

impl DesiredInterface {
	pub fn peers(&self) -> BTreeMap<WgPublicKey, PeerConfig> {
		self.config
			.peers
			.iter()
			.map(|p| (p.public_key, p.clone()))
			.collect()
	}
}

/// Configured interfaces that exist in the kernel, plus unconfigured kernel
/// interfaces matching the filter.
pub fn desired_interfaces(
	config: &DaemonConfig,
	kernel: &BTreeMap<String, Device>,
) -> BTreeMap<String, DesiredInterface> {
	let mut desired = BTreeMap::new();
	for (name, interface) in &config.interfaces {
		if !kernel.contains_key(name) {
			debug!(interface = %name, "configured interface is not present");
			continue;
		}
		desired.insert(
			name.clone(),
			DesiredInterface {
				name: name.clone(),
				config: interface.clone(),
				ice: config.ice_for(name),
				adopted: false,
			},
		);
	}
	for (name, device) in kernel {
		if desired.contains_key(name) || !config.matches_filter(name) {
			continue;
		}
		desired.insert(
			name.clone(),
			DesiredInterface {
				name: name.clone(),
				config: adopted_config(device),
				ice: config.ice.clone(),
				adopted: true,
			},
		);
	}
	desired
}

/// Takes the kernel's peers as the configuration of an adopted interface.
///
/// Endpoints are left out: the kernel endpoint is negotiated state.
pub fn adopted_config(device: &Device) -> InterfaceConfig {
	InterfaceConfig {
		private_key_file: None,
		listen_port: None,
		ice: None,
		peers: device.peers.iter().map(peer_from_device).collect(),
	}
}

fn peer_from_device(peer: &DevicePeer) -> PeerConfig {
	PeerConfig {
		public_key: peer.public_key,
		allowed_ips: peer.allowed_ips.clone(),
		endpoint: None,
		backend: None,
		persistent_keepalive: peer.persistent_keepalive,
	}
}

/// Device write bringing a kernel peer in line with its configuration, or
/// `None` when nothing differs.
///
/// A static endpoint is only written when the kernel has no endpoint yet.
pub fn peer_device_update(desired: &PeerConfig, live: Option<&DevicePeer>) -> Option<PeerUpdate> {
	let Some(live) = live else {
		return Some(PeerUpdate {
			public_key: desired.public_key,
			remove: false,
			endpoint: desired.endpoint,
			allowed_ips: Some(desired.allowed_ips.clone()),
			persistent_keepalive: desired.persistent_keepalive,
		});
	};

	let mut update = PeerUpdate::new(desired.public_key);
	let mut changed = false;
	if !same_networks(&live.allowed_ips, &desired.allowed_ips) {
		update.allowed_ips = Some(desired.allowed_ips.clone());
		changed = true;
	}
	if desired.persistent_keepalive.unwrap_or(0) != live.persistent_keepalive.unwrap_or(0) {
		update.persistent_keepalive = Some(desired.persistent_keepalive.unwrap_or(0));
		changed = true;
	}
	if live.endpoint.is_none() && desired.endpoint.is_some() {
		update.endpoint = desired.endpoint;
		changed = true;
	}
	changed.then_some(update)
}

fn same_networks(a: &[ipnet::IpNet], b: &[ipnet::IpNet]) -> bool {
	let mut a = a.to_vec();
	let mut b = b.to_vec();
	a.sort();
	b.sort();
	a == b
}

/// Peer set differences between two passes.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PeerDiff {
	pub added: Vec<PeerConfig>,
	pub removed: Vec<WgPublicKey>,
	pub changed: Vec<PeerConfig>,
}

impl PeerDiff {
	pub fn between(
		current: &BTreeMap<WgPublicKey, PeerConfig>,
		desired: &BTreeMap<WgPublicKey, PeerConfig>,
	) -> Self {
		let mut diff = PeerDiff::default();
		for (key, peer) in desired {
			match current.get(key) {
				None => diff.added.push(peer.clone()),
				Some(existing) if existing != peer => diff.changed.push(peer.clone()),
				Some(_) => {}
			}
		}
		diff.removed = current
			.keys()
			.filter(|key| !desired.contains_key(key))
			.copied()
			.collect();
		diff
	}

	pub fn is_empty(&self) -> bool {
		self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::SocketAddr;

	fn kernel(devices: Vec<Device>) -> BTreeMap<String, Device> {
		devices.into_iter().map(|d| (d.name.clone(), d)).collect()
	}

	fn device_with_peer(name: &str, peer: WgPublicKey) -> Device {
		let mut device = Device::new(name);
		let mut live = DevicePeer::new(peer);
		live.allowed_ips = vec!["10.1.0.2/32".parse().unwrap()];
		live.endpoint = Some("192.0.2.1:51820".parse().unwrap());
		device.peers.push(live);
		device
	}

	#[test]
	fn configured_interfaces_need_a_kernel_device() {
		let mut config = DaemonConfig::default();
		config
			.interfaces
			.insert("wg0".to_string(), InterfaceConfig::default());
		config.interface_filter = "nothing".to_string();

		assert!(desired_interfaces(&config, &BTreeMap::new()).is_empty());

		let desired = desired_interfaces(&config, &kernel(vec![Device::new("wg0")]));
		assert_eq!(desired.len(), 1);
		assert!(!desired["wg0"].adopted);
	}

	#[test]
	fn matching_kernel_interfaces_are_adopted_with_their_peers() {
		let peer = WgPublicKey::random();
		let mut config = DaemonConfig::default();
		config.interface_filter = "wg*".to_string();
		let devices = kernel(vec![device_with_peer("wg1", peer), Device::new("eth0")]);

		let desired = desired_interfaces(&config, &devices);
		assert_eq!(desired.keys().collect::<Vec<_>>(), vec!["wg1"]);
		let wg1 = &desired["wg1"];
		assert!(wg1.adopted);
		let adopted = wg1.config.peer(&peer).unwrap();
		assert_eq!(adopted.allowed_ips.len(), 1);
		assert_eq!(adopted.endpoint, None);
	}

	#[test]
	fn configuration_wins_over_adoption() {
		let peer = WgPublicKey::random();
		let mut config = DaemonConfig::default();
		config
			.interfaces
			.insert("wg0".to_string(), InterfaceConfig::default());
		let desired = desired_interfaces(&config, &kernel(vec![device_with_peer("wg0", peer)]));
		assert!(desired["wg0"].config.peers.is_empty());
	}

	#[test]
	fn missing_kernel_peer_is_written_in_full() {
		let mut peer = PeerConfig::new(WgPublicKey::random());
		let endpoint: SocketAddr = "192.0.2.7:51820".parse().unwrap();
		peer.endpoint = Some(endpoint);
		peer.persistent_keepalive = Some(25);

		let update = peer_device_update(&peer, None).unwrap();
		assert_eq!(update.endpoint, Some(endpoint));
		assert_eq!(update.allowed_ips, Some(Vec::new()));
		assert_eq!(update.persistent_keepalive, Some(25));
	}

	#[test]
	fn negotiated_endpoint_is_not_overwritten() {
		let key = WgPublicKey::random();
		let mut peer = PeerConfig::new(key);
		peer.allowed_ips = vec!["10.1.0.2/32".parse().unwrap()];
		peer.endpoint = Some("192.0.2.7:51820".parse().unwrap());
		let live = &device_with_peer("wg0", key).peers[0];

		assert_eq!(peer_device_update(&peer, Some(live)), None);

		peer.persistent_keepalive = Some(15);
		let update = peer_device_update(&peer, Some(live)).unwrap();
		assert_eq!(update.persistent_keepalive, Some(15));
		assert_eq!(update.endpoint, None);
		assert_eq!(update.allowed_ips, None);
	}

	#[test]
	fn diff_finds_added_removed_and_changed_peers() {
		let kept = PeerConfig::new(WgPublicKey::random());
		let gone = PeerConfig::new(WgPublicKey::random());
		let new = PeerConfig::new(WgPublicKey::random());
		let mut changed = kept.clone();
		changed.persistent_keepalive = Some(5);

		let current: BTreeMap<_, _> = [kept.clone(), gone.clone()]
			.into_iter()
			.map(|p| (p.public_key, p))
			.collect();
		let desired: BTreeMap<_, _> = [changed.clone(), new.clone()]
			.into_iter()
			.map(|p| (p.public_key, p))
			.collect();

		let diff = PeerDiff::between(&current, &desired);
		assert_eq!(diff.added, vec![new]);
		assert_eq!(diff.removed, vec![gone.public_key]);
		assert_eq!(diff.changed, vec![changed]);
		assert!(PeerDiff::between(&desired, &desired).is_empty());
	}
}
