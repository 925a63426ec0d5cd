// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Daemon configuration.
//!
//! Sources produce a [`ConfigLayer`] with every field optional; layers are
//! merged in precedence order and finalized into a [`DaemonConfig`].

use crate::error::ConfigError;
use ipnet::IpNet;
use loom_wgtunnel_common::WgPublicKey;
use loom_wgtunnel_epdisc::{IceServer, IceSettings};
use loom_wgtunnel_signaling::BackendType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BACKEND: &str = "mcast://239.0.0.1";
pub const DEFAULT_WATCH_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_INTERFACE_FILTER: &str = "*";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Linux limits interface names to 15 bytes.
const MAX_INTERFACE_NAME: usize = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	#[default]
	Pretty,
	Json,
}

impl fmt::Display for LogFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			LogFormat::Pretty => f.write_str("pretty"),
			LogFormat::Json => f.write_str("json"),
		}
	}
}

impl FromStr for LogFormat {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"pretty" | "text" => Ok(LogFormat::Pretty),
			"json" => Ok(LogFormat::Json),
			other => Err(format!("unknown log format '{other}'")),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
	pub level: String,
	pub format: LogFormat,
}

impl Default for LogConfig {
	fn default() -> Self {
		Self {
			level: DEFAULT_LOG_LEVEL.to_string(),
			format: LogFormat::default(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
	pub public_key: WgPublicKey,
	#[serde(default)]
	pub allowed_ips: Vec<IpNet>,
	/// Static endpoint used until a negotiated one replaces it.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub endpoint: Option<SocketAddr>,
	/// Signaling backend used when publishing to this peer.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub backend: Option<BackendType>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
	pub fn new(public_key: WgPublicKey) -> Self {
		Self {
			public_key,
			allowed_ips: Vec::new(),
			endpoint: None,
			backend: None,
			persistent_keepalive: None,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
	/// Created with a fresh key if missing. Without it the key already on
	/// the device is used.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub private_key_file: Option<PathBuf>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub listen_port: Option<u16>,
	/// Replaces the global ICE settings for this interface.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ice: Option<IceSettings>,
	#[serde(default)]
	pub peers: Vec<PeerConfig>,
}

impl InterfaceConfig {
	pub fn peer(&self, key: &WgPublicKey) -> Option<&PeerConfig> {
		self.peers.iter().find(|p| &p.public_key == key)
	}

	/// Inserts or replaces the peer with the same public key. Returns true if
	/// the peer is new.
	pub fn upsert_peer(&mut self, peer: PeerConfig) -> bool {
		match self.peers.iter_mut().find(|p| p.public_key == peer.public_key) {
			Some(existing) => {
				*existing = peer;
				false
			}
			None => {
				self.peers.push(peer);
				true
			}
		}
	}

	pub fn remove_peer(&mut self, key: &WgPublicKey) -> bool {
		let before = self.peers.len();
		self.peers.retain(|p| &p.public_key != key);
		self.peers.len() != before
	}
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
	pub backends: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub community: Option<String>,
	pub watch_interval_secs: u64,
	pub sync_interval_secs: u64,
	/// Unconfigured kernel interfaces matching this pattern are adopted.
	pub interface_filter: String,
	pub log: LogConfig,
	pub ice: IceSettings,
	#[serde(default)]
	pub interfaces: BTreeMap<String, InterfaceConfig>,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			backends: vec![DEFAULT_BACKEND.to_string()],
			community: None,
			watch_interval_secs: DEFAULT_WATCH_INTERVAL_SECS,
			sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
			interface_filter: DEFAULT_INTERFACE_FILTER.to_string(),
			log: LogConfig::default(),
			ice: IceSettings::default(),
			interfaces: BTreeMap::new(),
		}
	}
}

impl DaemonConfig {
	pub fn watch_interval(&self) -> Duration {
		Duration::from_secs(self.watch_interval_secs)
	}

	pub fn sync_interval(&self) -> Duration {
		Duration::from_secs(self.sync_interval_secs)
	}

	/// ICE settings in effect for `interface`.
	pub fn ice_for(&self, interface: &str) -> IceSettings {
		self.interfaces
			.get(interface)
			.and_then(|i| i.ice.clone())
			.unwrap_or_else(|| self.ice.clone())
	}

	pub fn matches_filter(&self, interface: &str) -> bool {
		match glob::Pattern::new(&self.interface_filter) {
			Ok(pattern) => pattern.matches(interface),
			Err(_) => false,
		}
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.backends.is_empty() {
			return Err(ConfigError::Invalid(
				"at least one signaling backend is required".to_string(),
			));
		}
		if self.watch_interval_secs == 0 {
			return Err(ConfigError::InvalidValue {
				key: "watch_interval_secs".to_string(),
				message: "must be greater than zero".to_string(),
			});
		}
		if self.sync_interval_secs == 0 {
			return Err(ConfigError::InvalidValue {
				key: "sync_interval_secs".to_string(),
				message: "must be greater than zero".to_string(),
			});
		}
		if let Err(e) = glob::Pattern::new(&self.interface_filter) {
			return Err(ConfigError::InvalidValue {
				key: "interface_filter".to_string(),
				message: e.to_string(),
			});
		}
		validate_ice("ice", &self.ice)?;

		for (name, interface) in &self.interfaces {
			if name.is_empty() || name.len() > MAX_INTERFACE_NAME {
				return Err(ConfigError::InvalidValue {
					key: format!("interfaces.{name}"),
					message: format!("interface names must be 1 to {MAX_INTERFACE_NAME} bytes"),
				});
			}
			if let Some(ice) = &interface.ice {
				validate_ice(&format!("interfaces.{name}.ice"), ice)?;
			}
			let mut seen = HashSet::new();
			for peer in &interface.peers {
				if !seen.insert(peer.public_key) {
					return Err(ConfigError::Invalid(format!(
						"interface {name} lists peer {} more than once",
						peer.public_key
					)));
				}
			}
		}
		Ok(())
	}
}

fn validate_ice(key: &str, ice: &IceSettings) -> Result<(), ConfigError> {
	let ranged = ice.port_min != 0 || ice.port_max != 0;
	if ranged && (ice.port_min == 0 || ice.port_max < ice.port_min) {
		return Err(ConfigError::InvalidValue {
			key: format!("{key}.port_min"),
			message: format!("invalid port range {}-{}", ice.port_min, ice.port_max),
		});
	}
	if ice.candidate_types.is_empty() {
		return Err(ConfigError::InvalidValue {
			key: format!("{key}.candidate_types"),
			message: "must not be empty".to_string(),
		});
	}
	if ice.network_types.is_empty() {
		return Err(ConfigError::InvalidValue {
			key: format!("{key}.network_types"),
			message: "must not be empty".to_string(),
		});
	}
	Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LogConfigLayer {
	pub level: Option<String>,
	pub format: Option<LogFormat>,
}

/// One source's view of the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
	pub backends: Option<Vec<String>>,
	pub community: Option<String>,
	pub watch_interval_secs: Option<u64>,
	pub sync_interval_secs: Option<u64>,
	pub interface_filter: Option<String>,
	pub log: Option<LogConfigLayer>,
	pub ice: Option<IceSettings>,
	/// STUN/TURN URLs replacing `ice.servers`.
	#[serde(skip)]
	pub ice_servers: Option<Vec<String>>,
	pub interfaces: Option<BTreeMap<String, InterfaceConfig>>,
}

impl ConfigLayer {
	/// Overlays `other` on `self`; fields set in `other` win.
	pub fn merge(&mut self, other: ConfigLayer) {
		if other.backends.is_some() {
			self.backends = other.backends;
		}
		if other.community.is_some() {
			self.community = other.community;
		}
		if other.watch_interval_secs.is_some() {
			self.watch_interval_secs = other.watch_interval_secs;
		}
		if other.sync_interval_secs.is_some() {
			self.sync_interval_secs = other.sync_interval_secs;
		}
		if other.interface_filter.is_some() {
			self.interface_filter = other.interface_filter;
		}
		if let Some(log) = other.log {
			let merged = self.log.get_or_insert_with(LogConfigLayer::default);
			if log.level.is_some() {
				merged.level = log.level;
			}
			if log.format.is_some() {
				merged.format = log.format;
			}
		}
		if other.ice.is_some() {
			self.ice = other.ice;
		}
		if other.ice_servers.is_some() {
			self.ice_servers = other.ice_servers;
		}
		if other.interfaces.is_some() {
			self.interfaces = other.interfaces;
		}
	}

	pub fn finalize(self) -> Result<DaemonConfig, ConfigError> {
		let defaults = DaemonConfig::default();
		let log = self.log.unwrap_or_default();
		let mut ice = self.ice.unwrap_or(defaults.ice);
		if let Some(urls) = self.ice_servers {
			ice.servers = urls.into_iter().map(IceServer::new).collect();
		}

		let config = DaemonConfig {
			backends: self.backends.unwrap_or(defaults.backends),
			community: self.community,
			watch_interval_secs: self.watch_interval_secs.unwrap_or(defaults.watch_interval_secs),
			sync_interval_secs: self.sync_interval_secs.unwrap_or(defaults.sync_interval_secs),
			interface_filter: self.interface_filter.unwrap_or(defaults.interface_filter),
			log: LogConfig {
				level: log.level.unwrap_or(defaults.log.level),
				format: log.format.unwrap_or(defaults.log.format),
			},
			ice,
			interfaces: self.interfaces.unwrap_or_default(),
		};
		config.validate()?;
		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_layer_finalizes_to_defaults() {
		let config = ConfigLayer::default().finalize().unwrap();
		assert_eq!(config, DaemonConfig::default());
		assert_eq!(config.watch_interval(), Duration::from_secs(5));
		assert_eq!(config.log.format, LogFormat::Pretty);
	}

	#[test]
	fn toml_round_trips_through_layer() {
		let peer = WgPublicKey::random();
		let text = format!(
			r#"
backends = ["inprocess://"]
sync_interval_secs = 30
interface_filter = "wg*"

[log]
format = "json"

[ice]
max_restarts = 3

[interfaces.wg0]
listen_port = 51820

[[interfaces.wg0.peers]]
public_key = "{peer}"
allowed_ips = ["10.1.0.2/32"]
backend = "relay"
persistent_keepalive = 25
"#
		);
		let layer: ConfigLayer = toml::from_str(&text).unwrap();
		let config = layer.finalize().unwrap();

		assert_eq!(config.backends, vec!["inprocess://"]);
		assert_eq!(config.sync_interval_secs, 30);
		assert_eq!(config.log.level, DEFAULT_LOG_LEVEL);
		assert_eq!(config.log.format, LogFormat::Json);
		assert_eq!(config.ice.max_restarts, 3);

		let wg0 = &config.interfaces["wg0"];
		assert_eq!(wg0.listen_port, Some(51820));
		let configured = wg0.peer(&peer).unwrap();
		assert_eq!(configured.backend, Some(BackendType::Relay));
		assert_eq!(configured.persistent_keepalive, Some(25));
		assert_eq!(configured.allowed_ips.len(), 1);

		assert!(config.matches_filter("wg1"));
		assert!(!config.matches_filter("eth0"));
	}

	#[test]
	fn unknown_top_level_keys_are_rejected() {
		assert!(toml::from_str::<ConfigLayer>("backend = [\"x\"]").is_err());
	}

	#[test]
	fn later_layers_override_earlier_ones() {
		let mut base = ConfigLayer {
			backends: Some(vec!["inprocess://".to_string()]),
			log: Some(LogConfigLayer {
				level: Some("debug".to_string()),
				format: None,
			}),
			..ConfigLayer::default()
		};
		base.merge(ConfigLayer {
			log: Some(LogConfigLayer {
				level: None,
				format: Some(LogFormat::Json),
			}),
			ice_servers: Some(vec!["stun:stun.example.com:3478".to_string()]),
			..ConfigLayer::default()
		});

		let config = base.finalize().unwrap();
		assert_eq!(config.backends, vec!["inprocess://"]);
		assert_eq!(config.log.level, "debug");
		assert_eq!(config.log.format, LogFormat::Json);
		assert_eq!(config.ice.servers.len(), 1);
		assert_eq!(config.ice.servers[0].url, "stun:stun.example.com:3478");
	}

	#[test]
	fn validation_rejects_bad_values() {
		let mut config = DaemonConfig::default();
		config.backends.clear();
		assert!(config.validate().is_err());

		let mut config = DaemonConfig::default();
		config.sync_interval_secs = 0;
		assert!(matches!(
			config.validate(),
			Err(ConfigError::InvalidValue { .. })
		));

		let mut config = DaemonConfig::default();
		config.ice.port_min = 5000;
		config.ice.port_max = 4000;
		assert!(config.validate().is_err());

		let mut config = DaemonConfig::default();
		config
			.interfaces
			.insert("a-very-long-interface".to_string(), InterfaceConfig::default());
		assert!(config.validate().is_err());

		let mut config = DaemonConfig::default();
		let peer = PeerConfig::new(WgPublicKey::random());
		config.interfaces.insert(
			"wg0".to_string(),
			InterfaceConfig {
				peers: vec![peer.clone(), peer],
				..InterfaceConfig::default()
			},
		);
		assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
	}

	#[test]
	fn interface_ice_override_wins() {
		let mut config = DaemonConfig::default();
		let ice = IceSettings {
			max_restarts: 1,
			..IceSettings::default()
		};
		config.interfaces.insert(
			"wg1".to_string(),
			InterfaceConfig {
				ice: Some(ice.clone()),
				..InterfaceConfig::default()
			},
		);
		assert_eq!(config.ice_for("wg1"), ice);
		assert_eq!(config.ice_for("wg0"), IceSettings::default());
	}

	#[test]
	fn upsert_replaces_existing_peer() {
		let key = WgPublicKey::random();
		let mut interface = InterfaceConfig::default();
		assert!(interface.upsert_peer(PeerConfig::new(key)));
		let mut updated = PeerConfig::new(key);
		updated.persistent_keepalive = Some(10);
		assert!(!interface.upsert_peer(updated));
		assert_eq!(interface.peers.len(), 1);
		assert_eq!(interface.peers[0].persistent_keepalive, Some(10));
		assert!(interface.remove_peer(&key));
		assert!(!interface.remove_peer(&key));
	}
}
