// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reconciliation daemon for WireGuard endpoint discovery.
//!
//! A [`Daemon`] watches the WireGuard interfaces on the host, runs one
//! [`EndpointDiscovery`](loom_wgtunnel_epdisc::EndpointDiscovery) per managed
//! interface and keeps its peers in line with the configuration. It is driven
//! through a [`DaemonHandle`].

pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod signals;
pub mod sources;
pub mod state;
pub mod watcher;

pub use config::{DaemonConfig, InterfaceConfig, LogConfig, LogFormat, PeerConfig};
pub use control::{DaemonHandle, DaemonStatus, InterfaceStatus};
pub use daemon::Daemon;
pub use error::{ConfigError, DaemonError, Result};
pub use sources::{load_config, load_config_with_file, ConfigLoader, SYSTEM_CONFIG_PATH};
