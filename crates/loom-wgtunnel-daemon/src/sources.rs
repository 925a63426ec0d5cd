// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: built-in defaults, a TOML file and `LOOM_WG_*`
//! environment variables.

use crate::config::{ConfigLayer, DaemonConfig, LogConfigLayer, LogFormat};
use crate::error::ConfigError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub const SYSTEM_CONFIG_PATH: &str = "/etc/loom/wgtunnel.toml";

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<ConfigLayer, ConfigError>;
}

pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<ConfigLayer, ConfigError> {
		debug!("loading defaults");
		Ok(ConfigLayer::default())
	}
}

/// TOML file source. A missing file yields an empty layer.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn system() -> Self {
		Self::new(SYSTEM_CONFIG_PATH)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<ConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(ConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: ConfigLayer = toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
			path: self.path.clone(),
			source: e,
		})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

/// Environment variable source.
///
/// Convention: `LOOM_WG_<FIELD>`. Lists are comma separated.
#[derive(Default)]
pub struct EnvSource {
	vars: Option<HashMap<String, String>>,
}

impl EnvSource {
	/// Reads the process environment.
	pub fn system() -> Self {
		Self { vars: None }
	}

	/// Reads from a fixed map instead of the process environment.
	pub fn from_vars<I, K, V>(vars: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		Self {
			vars: Some(
				vars.into_iter()
					.map(|(k, v)| (k.into(), v.into()))
					.collect(),
			),
		}
	}

	fn var(&self, name: &str) -> Option<String> {
		let value = match &self.vars {
			Some(vars) => vars.get(name).cloned(),
			None => std::env::var(name).ok(),
		};
		value.filter(|s| !s.is_empty())
	}

	fn list(&self, name: &str) -> Option<Vec<String>> {
		self.var(name).map(|v| {
			v.split(',')
				.map(str::trim)
				.filter(|s| !s.is_empty())
				.map(str::to_string)
				.collect()
		})
	}

	fn u64(&self, name: &str) -> Result<Option<u64>, ConfigError> {
		match self.var(name) {
			Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
				key: name.to_string(),
				message: format!("invalid u64 value '{v}'"),
			}),
			None => Ok(None),
		}
	}

	fn log_format(&self, name: &str) -> Result<Option<LogFormat>, ConfigError> {
		match self.var(name) {
			Some(v) => v
				.parse()
				.map(Some)
				.map_err(|message| ConfigError::InvalidValue {
					key: name.to_string(),
					message,
				}),
			None => Ok(None),
		}
	}
}

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<ConfigLayer, ConfigError> {
		debug!("loading environment variables");
		let level = self.var("LOOM_WG_LOG_LEVEL");
		let format = self.log_format("LOOM_WG_LOG_FORMAT")?;
		let log = (level.is_some() || format.is_some()).then_some(LogConfigLayer { level, format });

		Ok(ConfigLayer {
			backends: self.list("LOOM_WG_BACKENDS"),
			community: self.var("LOOM_WG_COMMUNITY"),
			watch_interval_secs: self.u64("LOOM_WG_WATCH_INTERVAL_SECS")?,
			sync_interval_secs: self.u64("LOOM_WG_SYNC_INTERVAL_SECS")?,
			interface_filter: self.var("LOOM_WG_INTERFACE_FILTER"),
			log,
			ice: None,
			ice_servers: self.list("LOOM_WG_ICE_SERVERS"),
			interfaces: None,
		})
	}
}

/// Loads and reloads the daemon configuration from its sources.
pub struct ConfigLoader {
	path: Option<PathBuf>,
	env: bool,
}

impl Default for ConfigLoader {
	fn default() -> Self {
		Self::new(Some(PathBuf::from(SYSTEM_CONFIG_PATH)))
	}
}

impl ConfigLoader {
	pub fn new(path: Option<PathBuf>) -> Self {
		Self { path, env: true }
	}

	/// Skips the process environment, for tests.
	pub fn without_env(mut self) -> Self {
		self.env = false;
		self
	}

	pub fn path(&self) -> Option<&Path> {
		self.path.as_deref()
	}

	pub fn load(&self) -> Result<DaemonConfig, ConfigError> {
		let mut sources: Vec<Box<dyn ConfigSource>> = vec![Box::new(DefaultsSource)];
		if let Some(path) = &self.path {
			sources.push(Box::new(TomlSource::new(path.clone())));
		}
		if self.env {
			sources.push(Box::new(EnvSource::system()));
		}
		merge_sources(sources)
	}
}

fn merge_sources(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<DaemonConfig, ConfigError> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = ConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		merged.merge(source.load()?);
	}
	merged.finalize()
}

/// Load configuration from all sources with standard precedence.
///
/// Precedence (highest to lowest):
/// 1. Environment variables (`LOOM_WG_*`)
/// 2. Config file (`/etc/loom/wgtunnel.toml`)
/// 3. Built-in defaults
pub fn load_config() -> Result<DaemonConfig, ConfigError> {
	ConfigLoader::default().load()
}

pub fn load_config_with_file(config_path: impl Into<PathBuf>) -> Result<DaemonConfig, ConfigError> {
	ConfigLoader::new(Some(config_path.into())).load()
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::NamedTempFile;

	fn write_config(content: &str) -> NamedTempFile {
		let mut file = NamedTempFile::new().unwrap();
		file.write_all(content.as_bytes()).unwrap();
		file
	}

	#[test]
	fn missing_file_is_an_empty_layer() {
		let layer = TomlSource::new("/nonexistent/wgtunnel.toml").load().unwrap();
		assert_eq!(layer, ConfigLayer::default());
	}

	#[test]
	fn malformed_file_is_a_parse_error() {
		let file = write_config("backends = [");
		let err = TomlSource::new(file.path()).load().unwrap_err();
		assert!(matches!(err, ConfigError::TomlParse { .. }));
	}

	#[test]
	fn env_parses_lists_and_numbers() {
		let env = EnvSource::from_vars([
			("LOOM_WG_BACKENDS", "inprocess://, mcast://239.0.0.1"),
			("LOOM_WG_WATCH_INTERVAL_SECS", "2"),
			("LOOM_WG_LOG_FORMAT", "json"),
			("LOOM_WG_COMMUNITY", ""),
		]);
		let layer = env.load().unwrap();
		assert_eq!(
			layer.backends,
			Some(vec!["inprocess://".to_string(), "mcast://239.0.0.1".to_string()])
		);
		assert_eq!(layer.watch_interval_secs, Some(2));
		assert_eq!(layer.community, None);
		assert_eq!(layer.log.unwrap().format, Some(LogFormat::Json));
	}

	#[test]
	fn env_rejects_bad_numbers() {
		let env = EnvSource::from_vars([("LOOM_WG_SYNC_INTERVAL_SECS", "soon")]);
		assert!(matches!(
			env.load(),
			Err(ConfigError::InvalidValue { key, .. }) if key == "LOOM_WG_SYNC_INTERVAL_SECS"
		));
	}

	#[test]
	fn environment_overrides_file() {
		let file = write_config(
			r#"
backends = ["mcast://239.0.0.2"]
community = "lab"
"#,
		);
		let sources: Vec<Box<dyn ConfigSource>> = vec![
			Box::new(EnvSource::from_vars([("LOOM_WG_BACKENDS", "inprocess://")])),
			Box::new(TomlSource::new(file.path())),
			Box::new(DefaultsSource),
		];
		let config = merge_sources(sources).unwrap();
		assert_eq!(config.backends, vec!["inprocess://"]);
		assert_eq!(config.community.as_deref(), Some("lab"));
	}

	#[test]
	fn loader_without_env_reads_only_the_file() {
		let file = write_config("watch_interval_secs = 9\n");
		let config = ConfigLoader::new(Some(file.path().to_path_buf()))
			.without_env()
			.load()
			.unwrap();
		assert_eq!(config.watch_interval_secs, 9);
	}
}
