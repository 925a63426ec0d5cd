// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_wgtunnel_signaling::{CandidateKind, NetworkType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A STUN or TURN server with optional static credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
	pub url: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub username: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub credential: Option<String>,
}

impl IceServer {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			username: None,
			credential: None,
		}
	}

	pub fn with_credentials(mut self, username: impl Into<String>, credential: impl Into<String>) -> Self {
		self.username = Some(username.into());
		self.credential = Some(credential.into());
		self
	}
}

impl fmt::Debug for IceServer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("IceServer")
			.field("url", &self.url)
			.field("username", &self.username)
			.field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
			.finish()
	}
}

/// ICE and timer settings for every session on an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceSettings {
	pub servers: Vec<IceServer>,
	pub candidate_types: Vec<CandidateKind>,
	pub network_types: Vec<NetworkType>,
	/// Local UDP port range; `0` leaves the bound unset.
	pub port_min: u16,
	pub port_max: u16,
	pub gather_timeout_secs: u64,
	pub check_timeout_secs: u64,
	pub restart_timeout_secs: u64,
	pub max_restarts: u32,
	pub disconnected_timeout_secs: u64,
	pub failed_timeout_secs: u64,
	pub keepalive_interval_secs: u64,
}

impl Default for IceSettings {
	fn default() -> Self {
		Self {
			servers: vec![IceServer::new("stun:stun.l.google.com:19302")],
			candidate_types: vec![CandidateKind::Host, CandidateKind::Srflx, CandidateKind::Relay],
			network_types: vec![NetworkType::Udp4, NetworkType::Udp6],
			port_min: 0,
			port_max: 0,
			gather_timeout_secs: 5,
			check_timeout_secs: 30,
			restart_timeout_secs: 10,
			max_restarts: 5,
			disconnected_timeout_secs: 5,
			failed_timeout_secs: 25,
			keepalive_interval_secs: 2,
		}
	}
}

impl IceSettings {
	pub fn gather_timeout(&self) -> Duration {
		Duration::from_secs(self.gather_timeout_secs)
	}

	pub fn check_timeout(&self) -> Duration {
		Duration::from_secs(self.check_timeout_secs)
	}

	pub fn restart_timeout(&self) -> Duration {
		Duration::from_secs(self.restart_timeout_secs)
	}

	pub fn disconnected_timeout(&self) -> Duration {
		Duration::from_secs(self.disconnected_timeout_secs)
	}

	pub fn failed_timeout(&self) -> Duration {
		Duration::from_secs(self.failed_timeout_secs)
	}

	pub fn keepalive_interval(&self) -> Duration {
		Duration::from_secs(self.keepalive_interval_secs)
	}

	/// True if switching to `other` requires a new ICE agent. Timer-only
	/// changes apply to a running agent.
	pub fn agent_differs(&self, other: &IceSettings) -> bool {
		self.servers != other.servers
			|| self.candidate_types != other.candidate_types
			|| self.network_types != other.network_types
			|| self.port_min != other.port_min
			|| self.port_max != other.port_max
			|| self.disconnected_timeout_secs != other.disconnected_timeout_secs
			|| self.failed_timeout_secs != other.failed_timeout_secs
			|| self.keepalive_interval_secs != other.keepalive_interval_secs
	}
}
