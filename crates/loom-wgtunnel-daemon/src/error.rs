// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("signaling error: {0}")]
	Signaling(#[from] loom_wgtunnel_signaling::SignalingError),

	#[error("endpoint discovery error: {0}")]
	Discovery(#[from] loom_wgtunnel_epdisc::EpdiscError),

	#[error("device error: {0}")]
	Device(#[from] loom_wgtunnel_epdisc::DeviceError),

	#[error("key error: {0}")]
	KeyFile(#[from] loom_wgtunnel_common::KeyFileError),

	#[error("unknown interface: {0}")]
	InterfaceNotFound(String),

	#[error("interface {0} has no private key")]
	MissingPrivateKey(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("daemon is not running")]
	NotRunning,
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("invalid value for {key}: {message}")]
	InvalidValue { key: String, message: String },

	#[error("invalid configuration: {0}")]
	Invalid(String),

	#[error("no configuration source to reload from")]
	NoSource,
}

pub type Result<T> = std::result::Result<T, DaemonError>;
