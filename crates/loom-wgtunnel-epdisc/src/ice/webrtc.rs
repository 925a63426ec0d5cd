// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! [`IceAgentFactory`] backed by `webrtc-ice`.

use super::{AgentConfig, AgentEvent, AgentState, IceAgent, IceAgentFactory, Role};
use crate::error::IceError;
use crate::settings::IceSettings;
use async_trait::async_trait;
use loom_wgtunnel_signaling::{Candidate, CandidateKind, Credentials, NetworkType};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument, warn};
use webrtc_ice::agent::agent_config::AgentConfig as RtcAgentConfig;
use webrtc_ice::agent::Agent;
use webrtc_ice::candidate::candidate_base::unmarshal_candidate;
use webrtc_ice::candidate::{Candidate as RtcCandidate, CandidateType};
use webrtc_ice::network_type::NetworkType as RtcNetworkType;
use webrtc_ice::state::ConnectionState;
use webrtc_ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc_ice::url::Url;

type SharedCandidate = Arc<dyn RtcCandidate + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
pub struct WebrtcAgentFactory;

impl WebrtcAgentFactory {
	pub fn new() -> Self {
		Self
	}
}

fn candidate_type(kind: CandidateKind) -> CandidateType {
	match kind {
		CandidateKind::Host => CandidateType::Host,
		CandidateKind::Srflx => CandidateType::ServerReflexive,
		CandidateKind::Prflx => CandidateType::PeerReflexive,
		CandidateKind::Relay => CandidateType::Relay,
	}
}

fn network_type(network: NetworkType) -> RtcNetworkType {
	match network {
		NetworkType::Udp4 => RtcNetworkType::Udp4,
		NetworkType::Udp6 => RtcNetworkType::Udp6,
		NetworkType::Tcp4 => RtcNetworkType::Tcp4,
		NetworkType::Tcp6 => RtcNetworkType::Tcp6,
	}
}

fn server_urls(settings: &IceSettings) -> Result<Vec<Url>, IceError> {
	settings
		.servers
		.iter()
		.map(|server| {
			let mut url = Url::parse_url(&server.url).map_err(|e| IceError::InvalidUrl {
				url: server.url.clone(),
				reason: e.to_string(),
			})?;
			if let Some(username) = &server.username {
				url.username = username.clone();
			}
			if let Some(credential) = &server.credential {
				url.password = credential.clone();
			}
			Ok(url)
		})
		.collect()
}

fn udp_network(settings: &IceSettings) -> Result<UDPNetwork, IceError> {
	if settings.port_min == 0 && settings.port_max == 0 {
		return Ok(UDPNetwork::default());
	}
	let invalid = || IceError::InvalidPortRange {
		min: settings.port_min,
		max: settings.port_max,
	};
	if settings.port_min == 0 || settings.port_max < settings.port_min {
		return Err(invalid());
	}
	let ephemeral = EphemeralUDP::new(settings.port_min, settings.port_max).map_err(|_| invalid())?;
	Ok(UDPNetwork::Ephemeral(ephemeral))
}

fn rtc_config(config: &AgentConfig) -> Result<RtcAgentConfig, IceError> {
	let settings = &config.settings;
	Ok(RtcAgentConfig {
		urls: server_urls(settings)?,
		udp_network: udp_network(settings)?,
		network_types: settings.network_types.iter().copied().map(network_type).collect(),
		candidate_types: settings
			.candidate_types
			.iter()
			.copied()
			.map(candidate_type)
			.collect(),
		local_ufrag: config.credentials.ufrag.clone(),
		local_pwd: config.credentials.pwd.clone(),
		disconnected_timeout: Some(settings.disconnected_timeout()),
		failed_timeout: Some(settings.failed_timeout()),
		keepalive_interval: Some(settings.keepalive_interval()),
		..Default::default()
	})
}

fn parse_local(candidate: &SharedCandidate) -> Option<Candidate> {
	let raw = candidate.marshal();
	match raw.parse() {
		Ok(candidate) => Some(candidate),
		Err(e) => {
			debug!(candidate = %raw, error = %e, "ignoring unparseable candidate");
			None
		}
	}
}

fn agent_state(state: ConnectionState) -> Option<AgentState> {
	match state {
		ConnectionState::Checking => Some(AgentState::Checking),
		ConnectionState::Connected | ConnectionState::Completed => Some(AgentState::Connected),
		ConnectionState::Disconnected => Some(AgentState::Disconnected),
		ConnectionState::Failed => Some(AgentState::Failed),
		ConnectionState::Closed => Some(AgentState::Closed),
		_ => None,
	}
}

#[async_trait]
impl IceAgentFactory for WebrtcAgentFactory {
	#[instrument(skip_all, fields(role = %config.role))]
	async fn create(
		&self,
		config: AgentConfig,
		events: mpsc::Sender<AgentEvent>,
	) -> Result<Arc<dyn IceAgent>, IceError> {
		let agent = Agent::new(rtc_config(&config)?)
			.await
			.map_err(|e| IceError::Agent(e.to_string()))?;
		let agent = Arc::new(agent);

		let tx = events.clone();
		agent.on_candidate(Box::new(move |candidate: Option<SharedCandidate>| {
			let tx = tx.clone();
			Box::pin(async move {
				let event = match candidate {
					Some(candidate) => match parse_local(&candidate) {
						Some(candidate) => AgentEvent::LocalCandidate(candidate),
						None => return,
					},
					None => AgentEvent::GatheringComplete,
				};
				let _ = tx.send(event).await;
			})
		}));

		let tx = events.clone();
		agent.on_connection_state_change(Box::new(move |state: ConnectionState| {
			let tx = tx.clone();
			Box::pin(async move {
				if let Some(state) = agent_state(state) {
					let _ = tx.send(AgentEvent::StateChanged(state)).await;
				}
			})
		}));

		let tx = events.clone();
		agent.on_selected_candidate_pair_change(Box::new(
			move |local: &SharedCandidate, remote: &SharedCandidate| {
				let tx = tx.clone();
				let pair = parse_local(local).zip(parse_local(remote));
				Box::pin(async move {
					if let Some((local, remote)) = pair {
						let _ = tx.send(AgentEvent::SelectedPair { local, remote }).await;
					}
				})
			},
		));

		let (shutdown_tx, _) = watch::channel(false);
		Ok(Arc::new(WebrtcAgent {
			agent,
			events,
			cancel: Mutex::new(None),
			shutdown: shutdown_tx,
		}))
	}
}

struct WebrtcAgent {
	agent: Arc<Agent>,
	events: mpsc::Sender<AgentEvent>,
	cancel: Mutex<Option<mpsc::Sender<()>>>,
	shutdown: watch::Sender<bool>,
}

#[async_trait]
impl IceAgent for WebrtcAgent {
	async fn gather_candidates(&self) -> Result<(), IceError> {
		self.agent
			.gather_candidates()
			.map_err(|e| IceError::Agent(e.to_string()))
	}

	async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), IceError> {
		let raw = candidate.to_string();
		let parsed = unmarshal_candidate(&raw).map_err(|e| IceError::InvalidCandidate(e.to_string()))?;
		let parsed: SharedCandidate = Arc::new(parsed);
		self.agent
			.add_remote_candidate(&parsed)
			.map_err(|e| IceError::Agent(e.to_string()))
	}

	async fn connect(&self, role: Role, remote: &Credentials) -> Result<(), IceError> {
		let (cancel_tx, cancel_rx) = mpsc::channel(1);
		{
			let mut cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
			if cancel.is_some() {
				return Err(IceError::Agent("connectivity checks already running".to_string()));
			}
			*cancel = Some(cancel_tx);
		}

		let agent = self.agent.clone();
		let events = self.events.clone();
		let mut shutdown = self.shutdown.subscribe();
		let ufrag = remote.ufrag.clone();
		let pwd = remote.pwd.clone();
		tokio::spawn(async move {
			let result = match role {
				Role::Controlling => agent
					.dial(cancel_rx, ufrag, pwd)
					.await
					.map(|c| c as std::sync::Arc<dyn std::any::Any + Send + Sync>),
				Role::Controlled => agent
					.accept(cancel_rx, ufrag, pwd)
					.await
					.map(|c| c as std::sync::Arc<dyn std::any::Any + Send + Sync>),
			};
			let _conn = match result {
				Ok(conn) => conn,
				Err(e) => {
					warn!(error = %e, "ICE connectivity checks failed");
					let _ = events.send(AgentEvent::StateChanged(AgentState::Failed)).await;
					return;
				}
			};
			// The connection stays usable only while it is alive.
			while !*shutdown.borrow() {
				if shutdown.changed().await.is_err() {
					break;
				}
			}
		});
		Ok(())
	}

	async fn close(&self) -> Result<(), IceError> {
		if let Some(cancel) = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take() {
			let _ = cancel.try_send(());
		}
		let _ = self.shutdown.send(true);
		self.agent
			.close()
			.await
			.map_err(|e| IceError::Agent(e.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::settings::IceServer;

	#[test]
	fn server_credentials_are_applied() {
		let settings = IceSettings {
			servers: vec![
				IceServer::new("stun:stun.example.com:3478"),
				IceServer::new("turn:turn.example.com:3478").with_credentials("alice", "secret"),
			],
			..IceSettings::default()
		};
		let urls = server_urls(&settings).unwrap();
		assert_eq!(urls.len(), 2);
		assert_eq!(urls[1].username, "alice");
		assert_eq!(urls[1].password, "secret");
	}

	#[test]
	fn invalid_server_url_is_rejected() {
		let settings = IceSettings {
			servers: vec![IceServer::new("http://not-ice")],
			..IceSettings::default()
		};
		assert!(matches!(server_urls(&settings), Err(IceError::InvalidUrl { .. })));
	}

	#[test]
	fn port_range_is_validated() {
		let mut settings = IceSettings::default();
		assert!(udp_network(&settings).is_ok());
		settings.port_min = 50000;
		settings.port_max = 40000;
		assert!(matches!(
			udp_network(&settings),
			Err(IceError::InvalidPortRange { .. })
		));
		settings.port_max = 50100;
		assert!(udp_network(&settings).is_ok());
	}

	#[test]
	fn candidate_text_is_understood_by_the_agent() {
		let candidate: Candidate = "842163049 1 udp 1677729535 203.0.113.7 40000 typ srflx raddr 10.0.0.5 rport 51820"
			.parse()
			.unwrap();
		let parsed = unmarshal_candidate(&candidate.to_string()).unwrap();
		assert_eq!(parsed.address(), "203.0.113.7");
		assert_eq!(parsed.port(), 40000);
		assert_eq!(parsed.candidate_type(), CandidateType::ServerReflexive);
	}
}
