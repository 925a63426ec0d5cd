// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use loom_wgtunnel_common::WgPublicKey;
use loom_wgtunnel_signaling::{Candidate, CandidateKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
	New,
	Gathering,
	Checking,
	Connected,
	Disconnected,
	Failed,
	Closed,
}

impl ConnectionState {
	pub fn as_str(&self) -> &'static str {
		match self {
			ConnectionState::New => "new",
			ConnectionState::Gathering => "gathering",
			ConnectionState::Checking => "checking",
			ConnectionState::Connected => "connected",
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Failed => "failed",
			ConnectionState::Closed => "closed",
		}
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// How traffic reaches the peer over the selected candidate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
	Direct,
	/// One side uses a TURN relay.
	Relayed,
	/// Both sides use TURN relays.
	RelayedBidir,
	None,
	Unknown,
}

impl Reachability {
	pub fn from_pair(local: &Candidate, remote: &Candidate) -> Self {
		match (local.kind == CandidateKind::Relay, remote.kind == CandidateKind::Relay) {
			(false, false) => Reachability::Direct,
			(true, true) => Reachability::RelayedBidir,
			_ => Reachability::Relayed,
		}
	}
}

/// Snapshot of one peer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
	pub interface: String,
	pub peer: WgPublicKey,
	pub state: ConnectionState,
	pub restarts: u32,
	pub last_state_change: DateTime<Utc>,
	pub epoch: u64,
	pub remote_epoch: Option<u64>,
	pub endpoint: Option<SocketAddr>,
	pub reachability: Reachability,
	pub local_candidate: Option<Candidate>,
	pub remote_candidate: Option<Candidate>,
}

impl PeerStatus {
	pub fn new(interface: impl Into<String>, peer: WgPublicKey) -> Self {
		Self {
			interface: interface.into(),
			peer,
			state: ConnectionState::New,
			restarts: 0,
			last_state_change: Utc::now(),
			epoch: 0,
			remote_epoch: None,
			endpoint: None,
			reachability: Reachability::None,
			local_candidate: None,
			remote_candidate: None,
		}
	}
}
