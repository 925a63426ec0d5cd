// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Seam between peer sessions and the ICE implementation.
//!
//! An agent reports everything it observes through the event channel it was
//! created with. Each agent gets its own channel, so events from an agent
//! that has been replaced never reach the session.

pub mod mock;
pub mod webrtc;

use crate::error::IceError;
use crate::settings::IceSettings;
use async_trait::async_trait;
use loom_wgtunnel_signaling::{Candidate, Credentials};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use self::webrtc::WebrtcAgentFactory;

/// Capacity of the per-agent event channel.
pub const AGENT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	Controlling,
	Controlled,
}

impl Role {
	pub fn from_controlling(controlling: bool) -> Self {
		if controlling {
			Role::Controlling
		} else {
			Role::Controlled
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Role::Controlling => f.write_str("controlling"),
			Role::Controlled => f.write_str("controlled"),
		}
	}
}

/// Connectivity as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
	Checking,
	Connected,
	Disconnected,
	Failed,
	Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
	LocalCandidate(Candidate),
	GatheringComplete,
	StateChanged(AgentState),
	SelectedPair { local: Candidate, remote: Candidate },
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
	pub settings: IceSettings,
	pub credentials: Credentials,
	pub role: Role,
}

#[async_trait]
pub trait IceAgent: Send + Sync {
	async fn gather_candidates(&self) -> Result<(), IceError>;

	async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), IceError>;

	/// Starts connectivity checks against the remote credentials. Returns
	/// once checks are running; the outcome arrives as agent events.
	async fn connect(&self, role: Role, remote: &Credentials) -> Result<(), IceError>;

	async fn close(&self) -> Result<(), IceError>;
}

#[async_trait]
pub trait IceAgentFactory: Send + Sync {
	async fn create(
		&self,
		config: AgentConfig,
		events: mpsc::Sender<AgentEvent>,
	) -> Result<Arc<dyn IceAgent>, IceError>;
}
