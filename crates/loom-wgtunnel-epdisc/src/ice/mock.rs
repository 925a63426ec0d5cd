// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Scriptable agents for exercising sessions without a network.

use super::{AgentConfig, AgentEvent, IceAgent, IceAgentFactory, Role};
use crate::error::IceError;
use async_trait::async_trait;
use loom_wgtunnel_signaling::{Candidate, Credentials};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

#[derive(Default)]
pub struct MockAgentFactory {
	agents: Mutex<Vec<Arc<MockAgent>>>,
	local_candidates: Mutex<Vec<Candidate>>,
	fail_create: AtomicBool,
	created: Notify,
}

impl MockAgentFactory {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Candidates each new agent reports when gathering, followed by
	/// `GatheringComplete`.
	pub fn with_local_candidates(candidates: Vec<Candidate>) -> Arc<Self> {
		let factory = Self::default();
		*factory.local_candidates.lock().unwrap_or_else(|e| e.into_inner()) = candidates;
		Arc::new(factory)
	}

	pub fn set_fail_create(&self, fail: bool) {
		self.fail_create.store(fail, Ordering::Release);
	}

	pub fn agents(&self) -> Vec<Arc<MockAgent>> {
		self.agents.lock().unwrap_or_else(|e| e.into_inner()).clone()
	}

	pub fn latest(&self) -> Option<Arc<MockAgent>> {
		self.agents().last().cloned()
	}

	/// Waits until at least `count` agents have been created.
	pub async fn wait_for_agents(&self, count: usize) -> Vec<Arc<MockAgent>> {
		loop {
			let notified = self.created.notified();
			let agents = self.agents();
			if agents.len() >= count {
				return agents;
			}
			notified.await;
		}
	}
}

#[async_trait]
impl IceAgentFactory for MockAgentFactory {
	async fn create(
		&self,
		config: AgentConfig,
		events: mpsc::Sender<AgentEvent>,
	) -> Result<Arc<dyn IceAgent>, IceError> {
		if self.fail_create.load(Ordering::Acquire) {
			return Err(IceError::Agent("agent creation disabled".to_string()));
		}
		let local_candidates = self
			.local_candidates
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.clone();
		let agent = Arc::new(MockAgent {
			config,
			events,
			local_candidates,
			remote_candidates: Mutex::new(Vec::new()),
			connects: Mutex::new(Vec::new()),
			connected: Notify::new(),
			closed: AtomicBool::new(false),
		});
		self.agents
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.push(agent.clone());
		self.created.notify_waiters();
		Ok(agent)
	}
}

pub struct MockAgent {
	config: AgentConfig,
	events: mpsc::Sender<AgentEvent>,
	local_candidates: Vec<Candidate>,
	remote_candidates: Mutex<Vec<Candidate>>,
	connects: Mutex<Vec<(Role, Credentials)>>,
	connected: Notify,
	closed: AtomicBool,
}

impl MockAgent {
	pub fn config(&self) -> &AgentConfig {
		&self.config
	}

	/// Reports `event` to the owning session. Returns false once the session
	/// has dropped this agent.
	pub async fn emit(&self, event: AgentEvent) -> bool {
		self.events.send(event).await.is_ok()
	}

	pub fn remote_candidates(&self) -> Vec<Candidate> {
		self.remote_candidates
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.clone()
	}

	pub fn connects(&self) -> Vec<(Role, Credentials)> {
		self.connects.lock().unwrap_or_else(|e| e.into_inner()).clone()
	}

	/// Waits for the first `connect` call.
	pub async fn wait_for_connect(&self) -> (Role, Credentials) {
		loop {
			let notified = self.connected.notified();
			if let Some(first) = self.connects().into_iter().next() {
				return first;
			}
			notified.await;
		}
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	fn ensure_open(&self) -> Result<(), IceError> {
		if self.is_closed() {
			return Err(IceError::Closed);
		}
		Ok(())
	}
}

#[async_trait]
impl IceAgent for MockAgent {
	async fn gather_candidates(&self) -> Result<(), IceError> {
		self.ensure_open()?;
		if self.local_candidates.is_empty() {
			return Ok(());
		}
		// try_send: the session drains this channel only after we return.
		for candidate in &self.local_candidates {
			let _ = self
				.events
				.try_send(AgentEvent::LocalCandidate(candidate.clone()));
		}
		let _ = self.events.try_send(AgentEvent::GatheringComplete);
		Ok(())
	}

	async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), IceError> {
		self.ensure_open()?;
		self.remote_candidates
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.push(candidate.clone());
		Ok(())
	}

	async fn connect(&self, role: Role, remote: &Credentials) -> Result<(), IceError> {
		self.ensure_open()?;
		self.connects
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.push((role, remote.clone()));
		self.connected.notify_waiters();
		Ok(())
	}

	async fn close(&self) -> Result<(), IceError> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Err(IceError::Closed);
		}
		Ok(())
	}
}
