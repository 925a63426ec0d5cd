// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-peer connectivity state machine.
//!
//! Each session runs in its own task and is the only code that touches its
//! ICE agent and state. Everything else talks to it through its inbox and
//! observes it through a status watch and the event bus.

use crate::device::{DeviceUpdate, PeerUpdate, WireGuardDevice};
use crate::error::{EpdiscError, Result};
use crate::events::{Event, EventBus};
use crate::ice::{AgentConfig, AgentEvent, AgentState, IceAgent, IceAgentFactory, Role, AGENT_EVENT_CAPACITY};
use crate::settings::IceSettings;
use crate::status::{ConnectionState, PeerStatus, Reachability};
use chrono::{DateTime, Utc};
use loom_wgtunnel_common::{Backoff, KeyPair, WgPublicKey};
use loom_wgtunnel_signaling::{
	Backend, Candidate, ChannelHandler, Credentials, Inbound, MessageHandler, SessionDescription,
	SignalingError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn, Instrument};

const INPUT_CAPACITY: usize = 16;
const SIGNAL_CAPACITY: usize = 32;
const SIGNALING_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSING_TIMEOUT: Duration = Duration::from_secs(2);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Collaborators shared by every session on an interface.
#[derive(Clone)]
pub struct SessionContext {
	pub backend: Arc<dyn Backend>,
	pub agents: Arc<dyn IceAgentFactory>,
	pub device: Arc<dyn WireGuardDevice>,
	pub events: EventBus,
}

enum SessionInput {
	Restart(oneshot::Sender<()>),
	UpdateSettings(IceSettings),
	Resync { kernel_endpoint: Option<SocketAddr> },
	Close(oneshot::Sender<()>),
}

struct PublishOutcome {
	epoch: u64,
	result: std::result::Result<(), SignalingError>,
}

/// Cloneable sender into a session's inbox.
#[derive(Clone)]
pub struct SessionControl {
	inputs: mpsc::Sender<SessionInput>,
}

impl SessionControl {
	async fn send(&self, input: SessionInput) -> Result<()> {
		self.inputs
			.send(input)
			.await
			.map_err(|_| EpdiscError::SessionClosed)
	}

	/// Re-runs negotiation with a new epoch. Counts as a restart.
	pub async fn restart(&self) -> Result<()> {
		let (tx, rx) = oneshot::channel();
		self.send(SessionInput::Restart(tx)).await?;
		rx.await.map_err(|_| EpdiscError::SessionClosed)
	}

	pub async fn update_settings(&self, settings: IceSettings) -> Result<()> {
		self.send(SessionInput::UpdateSettings(settings)).await
	}

	/// Re-applies the negotiated endpoint if the kernel reports a different
	/// one.
	pub async fn resync(&self, kernel_endpoint: Option<SocketAddr>) -> Result<()> {
		self.send(SessionInput::Resync { kernel_endpoint }).await
	}
}

pub struct SessionHandle {
	peer: WgPublicKey,
	control: SessionControl,
	status: watch::Receiver<PeerStatus>,
	task: JoinHandle<()>,
}

impl SessionHandle {
	pub fn spawn(
		interface: impl Into<String>,
		keys: KeyPair,
		settings: IceSettings,
		ctx: SessionContext,
	) -> Self {
		let interface = interface.into();
		let peer = keys.theirs;
		let (inputs_tx, inputs_rx) = mpsc::channel(INPUT_CAPACITY);
		let (status_tx, status_rx) = watch::channel(PeerStatus::new(interface.clone(), peer));
		let (handler, signals) = ChannelHandler::channel(SIGNAL_CAPACITY);
		let (publish_tx, published) = mpsc::channel(4);

		let session = PeerSession::new(interface, keys, settings, ctx, status_tx, handler, publish_tx);
		let task = tokio::spawn(session.run(inputs_rx, signals, published));

		Self {
			peer,
			control: SessionControl { inputs: inputs_tx },
			status: status_rx,
			task,
		}
	}

	pub fn peer(&self) -> &WgPublicKey {
		&self.peer
	}

	pub fn control(&self) -> SessionControl {
		self.control.clone()
	}

	pub fn status(&self) -> PeerStatus {
		self.status.borrow().clone()
	}

	pub fn watch(&self) -> watch::Receiver<PeerStatus> {
		self.status.clone()
	}

	/// Stops the session and waits for its task to finish.
	pub async fn close(self) -> Result<()> {
		let (tx, rx) = oneshot::channel();
		let sent = self.control.send(SessionInput::Close(tx)).await;
		if sent.is_ok() {
			let _ = rx.await;
		}
		if let Err(e) = self.task.await {
			warn!(peer = %self.peer, error = %e, "peer session task failed");
		}
		sent
	}
}

/// Epochs start at the wall clock in microseconds so a restarted process
/// does not reuse epochs the peer has already seen.
fn next_epoch(previous: u64) -> u64 {
	let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
	now.max(previous.saturating_add(1))
}

fn is_due(deadline: Option<Instant>, now: Instant) -> bool {
	deadline.is_some_and(|d| d <= now)
}

async fn next_agent_event(events: &mut Option<mpsc::Receiver<AgentEvent>>) -> Option<AgentEvent> {
	match events {
		Some(events) => events.recv().await,
		None => std::future::pending().await,
	}
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

struct PeerSession {
	interface: String,
	keys: KeyPair,
	controlling: bool,
	settings: IceSettings,
	ctx: SessionContext,
	status: watch::Sender<PeerStatus>,

	state: ConnectionState,
	restarts: u32,
	/// Restarts since the last time the peer was reachable.
	failed_restarts: u32,
	last_state_change: DateTime<Utc>,

	epoch: u64,
	local: Credentials,
	local_candidates: Vec<Candidate>,
	gathered: bool,
	agent: Option<Arc<dyn IceAgent>>,
	agent_events: Option<mpsc::Receiver<AgentEvent>>,

	remote_epoch: Option<u64>,
	/// A remote description has been applied to the current agent.
	remote_applied: bool,

	selected: Option<(Candidate, Candidate)>,
	endpoint: Option<SocketAddr>,
	endpoint_applied: bool,

	handler: Arc<ChannelHandler>,
	subscribed: bool,
	subscribe_backoff: Backoff,
	subscribe_at: Option<Instant>,

	publish_tx: mpsc::Sender<PublishOutcome>,
	publish_task: Option<JoinHandle<()>>,
	publish_pending: bool,
	publish_backoff: Backoff,
	publish_at: Option<Instant>,

	gather_deadline: Option<Instant>,
	check_deadline: Option<Instant>,
	restart_deadline: Option<Instant>,
}

impl PeerSession {
	fn new(
		interface: String,
		keys: KeyPair,
		settings: IceSettings,
		ctx: SessionContext,
		status: watch::Sender<PeerStatus>,
		handler: Arc<ChannelHandler>,
		publish_tx: mpsc::Sender<PublishOutcome>,
	) -> Self {
		let controlling = keys.ours.public_key() > keys.theirs;
		Self {
			interface,
			keys,
			controlling,
			settings,
			ctx,
			status,
			state: ConnectionState::New,
			restarts: 0,
			failed_restarts: 0,
			last_state_change: Utc::now(),
			epoch: 0,
			local: Credentials::generate(),
			local_candidates: Vec::new(),
			gathered: false,
			agent: None,
			agent_events: None,
			remote_epoch: None,
			remote_applied: false,
			selected: None,
			endpoint: None,
			endpoint_applied: false,
			handler,
			subscribed: false,
			subscribe_backoff: Backoff::new(BACKOFF_INITIAL, BACKOFF_MAX),
			subscribe_at: None,
			publish_tx,
			publish_task: None,
			publish_pending: false,
			publish_backoff: Backoff::new(BACKOFF_INITIAL, BACKOFF_MAX),
			publish_at: None,
			gather_deadline: None,
			check_deadline: None,
			restart_deadline: None,
		}
	}

	#[instrument(name = "peer_session", skip_all, fields(interface = %self.interface, peer = %self.keys.theirs))]
	async fn run(
		mut self,
		mut inputs: mpsc::Receiver<SessionInput>,
		mut signals: mpsc::Receiver<Inbound>,
		mut published: mpsc::Receiver<PublishOutcome>,
	) {
		debug!(controlling = self.controlling, "peer session started");
		self.subscribe().await;
		self.start_round(false).await;

		loop {
			let deadline = self.next_deadline();
			tokio::select! {
				biased;

				input = inputs.recv() => match input {
					Some(SessionInput::Close(ack)) => {
						self.shutdown().await;
						let _ = ack.send(());
						break;
					}
					Some(input) => self.handle_input(input).await,
					None => {
						self.shutdown().await;
						break;
					}
				},

				Some(event) = next_agent_event(&mut self.agent_events) => {
					self.handle_agent_event(event).await;
				}

				Some(inbound) = signals.recv() => {
					self.handle_description(inbound.description).await;
				}

				Some(outcome) = published.recv() => {
					self.handle_published(outcome);
				}

				_ = sleep_until(deadline) => {
					self.handle_timers().await;
				}
			}
		}

		debug!("peer session stopped");
	}

	fn next_deadline(&self) -> Option<Instant> {
		[
			self.subscribe_at,
			self.publish_at,
			self.gather_deadline,
			self.check_deadline,
			self.restart_deadline,
		]
		.into_iter()
		.flatten()
		.min()
	}

	async fn handle_input(&mut self, input: SessionInput) {
		match input {
			SessionInput::Restart(ack) => {
				if self.state != ConnectionState::Closed {
					info!(restarts = self.restarts + 1, "restart requested");
					self.restarts += 1;
					self.failed_restarts = 0;
					self.start_round(true).await;
				}
				let _ = ack.send(());
			}
			SessionInput::UpdateSettings(settings) => self.update_settings(settings).await,
			SessionInput::Resync { kernel_endpoint } => self.resync(kernel_endpoint).await,
			SessionInput::Close(_) => {}
		}
	}

	async fn update_settings(&mut self, settings: IceSettings) {
		if settings == self.settings {
			return;
		}
		let rebuild = self.settings.agent_differs(&settings);
		self.settings = settings;
		if rebuild
			&& matches!(
				self.state,
				ConnectionState::Gathering | ConnectionState::Checking | ConnectionState::Disconnected
			) {
			info!("ICE settings changed, restarting negotiation");
			self.start_round(true).await;
		}
	}

	async fn resync(&mut self, kernel_endpoint: Option<SocketAddr>) {
		if self.state != ConnectionState::Connected {
			return;
		}
		let Some(endpoint) = self.endpoint else {
			return;
		};
		if self.endpoint_applied && kernel_endpoint == Some(endpoint) {
			return;
		}
		debug!(%endpoint, kernel = ?kernel_endpoint, "re-applying negotiated endpoint");
		self.set_endpoint(endpoint).await;
	}

	async fn handle_timers(&mut self) {
		let now = Instant::now();

		if is_due(self.subscribe_at, now) {
			self.subscribe_at = None;
			self.subscribe().await;
		}

		if is_due(self.gather_deadline, now) {
			self.gather_deadline = None;
			if !self.gathered {
				debug!(
					candidates = self.local_candidates.len(),
					"candidate gathering timed out"
				);
				self.gathered = true;
				self.publish_now();
			}
		}

		if is_due(self.publish_at, now) {
			self.publish_at = None;
			self.publish_now();
		}

		if is_due(self.check_deadline, now) {
			self.check_deadline = None;
			if self.state == ConnectionState::Checking {
				warn!("connectivity checks timed out");
				self.connection_lost(false).await;
			}
		}

		if is_due(self.restart_deadline, now) {
			self.restart_deadline = None;
			if self.state == ConnectionState::Disconnected {
				self.restart_after_loss().await;
			}
		}
	}

	/// Creates a fresh agent and credentials under a new epoch.
	async fn start_round(&mut self, restart: bool) {
		self.close_agent().await;
		if let Some(task) = self.publish_task.take() {
			task.abort();
		}
		self.publish_pending = false;
		self.publish_at = None;
		self.publish_backoff.reset();

		self.epoch = next_epoch(self.epoch);
		self.local = Credentials::generate();
		self.local_candidates.clear();
		self.gathered = false;
		self.remote_applied = false;
		self.selected = None;

		let (tx, rx) = mpsc::channel(AGENT_EVENT_CAPACITY);
		let config = AgentConfig {
			settings: self.settings.clone(),
			credentials: self.local.clone(),
			role: Role::from_controlling(self.controlling),
		};
		let agent = match self.ctx.agents.create(config, tx).await {
			Ok(agent) => agent,
			Err(e) => {
				error!(error = %e, "failed to create ICE agent");
				self.fail().await;
				return;
			}
		};
		if let Err(e) = agent.gather_candidates().await {
			error!(error = %e, "failed to start candidate gathering");
			if let Err(e) = agent.close().await {
				debug!(error = %e, "failed to close ICE agent");
			}
			self.fail().await;
			return;
		}
		self.agent = Some(agent);
		self.agent_events = Some(rx);
		self.gather_deadline = Some(Instant::now() + self.settings.gather_timeout());

		debug!(epoch = self.epoch, restart, "started negotiation round");
		if restart {
			self.transition(ConnectionState::Checking);
			self.check_deadline = Some(Instant::now() + self.settings.check_timeout());
		} else {
			self.transition(ConnectionState::Gathering);
		}
		self.publish_status();
	}

	async fn close_agent(&mut self) {
		self.agent_events = None;
		if let Some(agent) = self.agent.take() {
			if let Err(e) = agent.close().await {
				debug!(error = %e, "failed to close ICE agent");
			}
		}
	}

	async fn fail(&mut self) {
		self.close_agent().await;
		if let Some(task) = self.publish_task.take() {
			task.abort();
		}
		self.publish_at = None;
		self.gather_deadline = None;
		self.restart_deadline = None;
		self.transition(ConnectionState::Failed);
		self.check_deadline = None;
	}

	async fn connection_lost(&mut self, grace: bool) {
		self.transition(ConnectionState::Disconnected);
		if grace {
			self.restart_deadline = Some(Instant::now() + self.settings.restart_timeout());
		} else {
			self.restart_after_loss().await;
		}
	}

	async fn restart_after_loss(&mut self) {
		if self.failed_restarts >= self.settings.max_restarts {
			error!(
				restarts = self.restarts,
				failed = self.failed_restarts,
				"restart budget exhausted"
			);
			self.fail().await;
			return;
		}
		self.restarts += 1;
		self.failed_restarts += 1;
		info!(restarts = self.restarts, failed = self.failed_restarts, "restarting negotiation");
		self.start_round(true).await;
	}

	fn transition(&mut self, new: ConnectionState) {
		if self.state == new {
			return;
		}
		let old = std::mem::replace(&mut self.state, new);
		self.last_state_change = Utc::now();
		self.check_deadline = if new == ConnectionState::Checking {
			Some(Instant::now() + self.settings.check_timeout())
		} else {
			None
		};
		if new != ConnectionState::Disconnected {
			self.restart_deadline = None;
		}

		info!(%old, %new, restarts = self.restarts, "peer connection state changed");
		self.ctx.events.publish(Event::PeerStateChanged {
			interface: self.interface.clone(),
			peer: self.keys.theirs,
			old,
			new,
			restarts: self.restarts,
		});
		self.publish_status();
	}

	async fn subscribe(&mut self) {
		let handler: Arc<dyn MessageHandler> = self.handler.clone();
		let result =
			tokio::time::timeout(SIGNALING_TIMEOUT, self.ctx.backend.subscribe(&self.keys, handler))
				.await;
		match result {
			Ok(Ok(_)) => {
				debug!("subscribed to signaling channel");
				self.subscribed = true;
				self.subscribe_backoff.reset();
				return;
			}
			Ok(Err(e)) => warn!(error = %e, "failed to subscribe to signaling channel"),
			Err(_) => warn!("subscribing to signaling channel timed out"),
		}
		self.subscribe_at = Some(Instant::now() + self.subscribe_backoff.next_delay());
	}

	fn publish_now(&mut self) {
		if self.agent.is_none() {
			return;
		}
		if self.publish_task.is_some() {
			self.publish_pending = true;
			return;
		}
		self.publish_at = None;

		let description = SessionDescription::new(
			self.epoch,
			self.local.clone(),
			self.local_candidates.clone(),
		)
		.with_need_reply(!self.remote_applied);
		let backend = self.ctx.backend.clone();
		let keys = self.keys.clone();
		let tx = self.publish_tx.clone();
		self.publish_task = Some(tokio::spawn(
			async move {
				let epoch = description.epoch;
				let result = match tokio::time::timeout(
					SIGNALING_TIMEOUT,
					backend.publish(&keys, &description),
				)
				.await
				{
					Ok(result) => result,
					Err(_) => Err(SignalingError::Transport("publish timed out".to_string())),
				};
				let _ = tx.send(PublishOutcome { epoch, result }).await;
			}
			.in_current_span(),
		));
	}

	fn handle_published(&mut self, outcome: PublishOutcome) {
		if outcome.epoch != self.epoch {
			return;
		}
		self.publish_task = None;
		match outcome.result {
			Ok(()) => {
				debug!(epoch = outcome.epoch, "published session description");
				if self.remote_applied {
					self.publish_backoff.reset();
				} else {
					self.publish_at = Some(Instant::now() + self.publish_backoff.next_delay());
				}
			}
			Err(e) => {
				warn!(error = %e, "failed to publish session description");
				self.publish_at = Some(Instant::now() + self.publish_backoff.next_delay());
			}
		}
		if std::mem::take(&mut self.publish_pending) {
			self.publish_now();
		}
	}

	async fn handle_description(&mut self, description: SessionDescription) {
		match self.state {
			ConnectionState::Closed => return,
			ConnectionState::Failed => {
				debug!(epoch = description.epoch, "session failed, ignoring description");
				return;
			}
			_ => {}
		}
		if !description.is_newer_than(self.remote_epoch) {
			debug!(
				epoch = description.epoch,
				last = ?self.remote_epoch,
				"dropping stale session description"
			);
			return;
		}
		if description.closing {
			self.remote_epoch = Some(description.epoch);
			if self.state != ConnectionState::Gathering || self.remote_applied {
				info!(epoch = description.epoch, "peer closed its session");
				self.start_round(false).await;
			}
			return;
		}
		if self.remote_applied {
			info!(epoch = description.epoch, "peer restarted negotiation");
			self.start_round(true).await;
			if self.agent.is_none() {
				return;
			}
		}
		self.apply_remote(description).await;
	}

	async fn apply_remote(&mut self, description: SessionDescription) {
		let Some(agent) = self.agent.clone() else {
			return;
		};
		self.remote_epoch = Some(description.epoch);
		self.remote_applied = true;
		self.publish_at = None;
		self.publish_backoff.reset();

		for candidate in &description.candidates {
			if let Err(e) = agent.add_remote_candidate(candidate).await {
				debug!(candidate = %candidate, error = %e, "skipping remote candidate");
			}
		}

		let role = Role::from_controlling(self.controlling);
		debug!(
			epoch = description.epoch,
			candidates = description.candidates.len(),
			%role,
			"applying remote session description"
		);
		if let Err(e) = agent.connect(role, &description.credentials).await {
			error!(error = %e, "failed to start connectivity checks");
			self.connection_lost(false).await;
			return;
		}
		self.transition(ConnectionState::Checking);

		if description.need_reply && self.gathered {
			self.publish_now();
		}
		self.publish_status();
	}

	async fn handle_agent_event(&mut self, event: AgentEvent) {
		match event {
			AgentEvent::LocalCandidate(candidate) => {
				debug!(candidate = %candidate, "gathered local candidate");
				self.local_candidates.push(candidate);
			}
			AgentEvent::GatheringComplete => {
				if !self.gathered {
					debug!(candidates = self.local_candidates.len(), "candidate gathering complete");
					self.gathered = true;
					self.gather_deadline = None;
					self.publish_now();
				}
			}
			AgentEvent::SelectedPair { local, remote } => {
				debug!(local = %local, remote = %remote, "selected candidate pair");
				self.selected = Some((local, remote));
				if self.state == ConnectionState::Connected {
					self.apply_endpoint().await;
				}
				self.publish_status();
			}
			AgentEvent::StateChanged(AgentState::Connected) => self.connected().await,
			AgentEvent::StateChanged(AgentState::Disconnected) => {
				if self.state == ConnectionState::Connected {
					warn!("lost connectivity to peer");
					self.connection_lost(true).await;
				}
			}
			AgentEvent::StateChanged(AgentState::Failed) => {
				if matches!(
					self.state,
					ConnectionState::Checking | ConnectionState::Connected | ConnectionState::Disconnected
				) {
					error!("ICE negotiation failed");
					self.connection_lost(false).await;
				}
			}
			AgentEvent::StateChanged(AgentState::Checking | AgentState::Closed) => {}
		}
	}

	async fn connected(&mut self) {
		if !matches!(
			self.state,
			ConnectionState::Checking | ConnectionState::Disconnected | ConnectionState::Connected
		) {
			return;
		}
		// Commit the endpoint before announcing the state.
		self.apply_endpoint().await;
		self.failed_restarts = 0;
		self.transition(ConnectionState::Connected);
		self.publish_status();
	}

	async fn apply_endpoint(&mut self) {
		let Some((_, remote)) = &self.selected else {
			return;
		};
		let Some(endpoint) = remote.socket_addr() else {
			warn!(candidate = %remote, "selected candidate has no usable address");
			return;
		};
		if self.endpoint == Some(endpoint) && self.endpoint_applied {
			return;
		}
		self.endpoint = Some(endpoint);
		self.set_endpoint(endpoint).await;
	}

	async fn set_endpoint(&mut self, endpoint: SocketAddr) {
		let update = DeviceUpdate::peer(PeerUpdate::endpoint(self.keys.theirs, endpoint));
		match self.ctx.device.set(&self.interface, update).await {
			Ok(()) => {
				info!(%endpoint, "updated peer endpoint");
				self.endpoint_applied = true;
			}
			Err(e) => {
				warn!(%endpoint, error = %e, "failed to set peer endpoint");
				self.endpoint_applied = false;
				self.ctx.events.publish(Event::Warning {
					interface: Some(self.interface.clone()),
					peer: Some(self.keys.theirs),
					message: format!("failed to set endpoint {}: {}", endpoint, e),
				});
			}
		}
		self.publish_status();
	}

	async fn shutdown(&mut self) {
		if let Some(task) = self.publish_task.take() {
			task.abort();
		}
		self.publish_at = None;
		self.subscribe_at = None;
		self.gather_deadline = None;
		self.restart_deadline = None;

		if self.remote_epoch.is_some() {
			self.publish_closing().await;
		}
		if self.subscribed {
			match tokio::time::timeout(SIGNALING_TIMEOUT, self.ctx.backend.unsubscribe(&self.keys)).await {
				Ok(Ok(_)) => {}
				Ok(Err(e)) => debug!(error = %e, "failed to unsubscribe from signaling channel"),
				Err(_) => warn!("unsubscribing from signaling channel timed out"),
			}
			self.subscribed = false;
		}
		self.close_agent().await;
		self.transition(ConnectionState::Closed);
	}

	/// Tells the peer to drop its state for us so it waits for a fresh round.
	async fn publish_closing(&mut self) {
		self.epoch = next_epoch(self.epoch);
		let description = SessionDescription::closing(self.epoch, self.local.clone());
		match tokio::time::timeout(CLOSING_TIMEOUT, self.ctx.backend.publish(&self.keys, &description)).await {
			Ok(Ok(())) => debug!(epoch = self.epoch, "published closing description"),
			Ok(Err(e)) => debug!(error = %e, "failed to publish closing description"),
			Err(_) => debug!("publishing closing description timed out"),
		}
	}

	fn publish_status(&self) {
		let reachability = match (&self.state, &self.selected) {
			(ConnectionState::Connected, Some((local, remote))) => Reachability::from_pair(local, remote),
			(ConnectionState::Connected, None) => Reachability::Unknown,
			_ => Reachability::None,
		};
		let (local_candidate, remote_candidate) = match &self.selected {
			Some((local, remote)) => (Some(local.clone()), Some(remote.clone())),
			None => (None, None),
		};
		self.status.send_replace(PeerStatus {
			interface: self.interface.clone(),
			peer: self.keys.theirs,
			state: self.state,
			restarts: self.restarts,
			last_state_change: self.last_state_change,
			epoch: self.epoch,
			remote_epoch: self.remote_epoch,
			endpoint: self.endpoint,
			reachability,
			local_candidate,
			remote_candidate,
		});
	}
}
