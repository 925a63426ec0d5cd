// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_wgtunnel_common::{WgKeyPair, WgPublicKey};
use loom_wgtunnel_epdisc::{
	AgentEvent, AgentState, ConnectionState, Device, EndpointDiscovery, EpdiscError, Event,
	EventBus, EventSubscription, IceSettings, MemoryDevice, MockAgentFactory, PeerStatus,
	Reachability, Role, WireGuardDevice,
};
use loom_wgtunnel_signaling::{Candidate, Credentials, Envelope, ManualBackend, SessionDescription};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const INTERFACE: &str = "wg0";

fn host(addr: &str, port: u16) -> Candidate {
	format!("1 1 udp 2130706431 {} {} typ host", addr, port)
		.parse()
		.unwrap()
}

struct Harness {
	local: WgKeyPair,
	remote: WgKeyPair,
	backend: Arc<ManualBackend>,
	agents: Arc<MockAgentFactory>,
	device: Arc<MemoryDevice>,
	events: EventBus,
	discovery: EndpointDiscovery,
}

impl Harness {
	fn new(settings: IceSettings) -> Self {
		let local = WgKeyPair::generate();
		let remote = WgKeyPair::generate();
		let backend = Arc::new(ManualBackend::default());
		let agents = MockAgentFactory::with_local_candidates(vec![host("192.168.1.2", 51820)]);
		let device = Arc::new(MemoryDevice::new());
		device.add_interface(Device::new(INTERFACE));
		let events = EventBus::default();
		let discovery = EndpointDiscovery::new(
			INTERFACE,
			local.clone(),
			settings,
			backend.clone(),
			agents.clone(),
			device.clone(),
			events.clone(),
		);
		Self {
			local,
			remote,
			backend,
			agents,
			device,
			events,
			discovery,
		}
	}

	fn peer(&self) -> WgPublicKey {
		*self.remote.public_key()
	}

	/// Delivers a description as if the remote peer had published it.
	fn inject(&self, description: &SessionDescription) {
		let envelope = Envelope::seal(description, &self.remote.pair_with(*self.local.public_key())).unwrap();
		self.backend.inject(&envelope);
	}

	/// Descriptions we published for the remote peer.
	fn published(&self) -> Vec<SessionDescription> {
		let kp = self.remote.pair_with(*self.local.public_key());
		self.backend
			.published()
			.iter()
			.map(|envelope| envelope.open(&kp).unwrap())
			.collect()
	}

	async fn add_and_wait_published(&self) {
		assert!(self.discovery.add_peer(self.peer()).await.unwrap());
		self.backend.wait_for_published(1).await;
	}

	async fn wait_for_state(&self, state: ConnectionState) -> PeerStatus {
		let mut rx = self.discovery.watch_peer(&self.peer()).await.unwrap();
		let status = tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| s.state == state))
			.await
			.expect("state not reached")
			.unwrap()
			.clone();
		status
	}
}

fn remote_description(epoch: u64) -> SessionDescription {
	SessionDescription::new(epoch, Credentials::generate(), vec![host("10.0.0.5", 51820)])
}

fn drain(events: &mut EventSubscription) -> Vec<Event> {
	let mut out = Vec::new();
	while let Some(event) = events.try_recv() {
		out.push(event);
	}
	out
}

fn entered(events: &[Event], state: ConnectionState) -> usize {
	events
		.iter()
		.filter(|e| matches!(e, Event::PeerStateChanged { new, .. } if *new == state))
		.count()
}

async fn settle() {
	tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn connected_pair_sets_endpoint_exactly_once() {
	let h = Harness::new(IceSettings::default());
	let mut events = h.events.subscribe();
	h.add_and_wait_published().await;

	let ours = h.published();
	assert!(ours[0].need_reply);
	assert_eq!(ours[0].candidates, vec![host("192.168.1.2", 51820)]);

	let theirs = remote_description(1);
	h.inject(&theirs);
	let agent = h.agents.latest().unwrap();
	let (role, credentials) = agent.wait_for_connect().await;
	assert_eq!(credentials, theirs.credentials);
	assert_eq!(
		role,
		Role::from_controlling(h.local.is_controlling(h.remote.public_key()))
	);
	assert_eq!(agent.remote_candidates(), theirs.candidates);

	let pair = AgentEvent::SelectedPair {
		local: host("192.168.1.2", 51820),
		remote: host("10.0.0.5", 51820),
	};
	assert!(agent.emit(pair.clone()).await);
	assert!(agent.emit(AgentEvent::StateChanged(AgentState::Connected)).await);
	let status = h.wait_for_state(ConnectionState::Connected).await;
	assert_eq!(status.reachability, Reachability::Direct);

	let endpoint: SocketAddr = "10.0.0.5:51820".parse().unwrap();
	assert_eq!(status.endpoint, Some(endpoint));
	assert_eq!(h.device.endpoint_updates(INTERFACE, &h.peer()), vec![endpoint]);

	// Repeated agent reports and a sync with a matching kernel view change
	// nothing.
	assert!(agent.emit(pair).await);
	assert!(agent.emit(AgentEvent::StateChanged(AgentState::Connected)).await);
	let live = h.device.get(INTERFACE).await.unwrap();
	h.discovery.sync(&live).await.unwrap();
	settle().await;
	assert_eq!(h.device.updates().len(), 1);
	assert_eq!(entered(&drain(&mut events), ConnectionState::Connected), 1);
}

#[tokio::test(start_paused = true)]
async fn no_remote_description_means_no_device_updates() {
	let h = Harness::new(IceSettings::default());
	h.add_and_wait_published().await;

	tokio::time::sleep(Duration::from_secs(120)).await;

	assert!(h.device.updates().is_empty());
	let status = h.discovery.peer_status(&h.peer()).await.unwrap();
	assert_eq!(status.state, ConnectionState::Gathering);
	assert_eq!(status.endpoint, None);
	// Unanswered descriptions are republished with need_reply set.
	let published = h.published();
	assert!(published.len() > 1);
	assert!(published.iter().all(|d| d.need_reply));
	assert!(published.iter().all(|d| d.epoch == published[0].epoch));
}

#[tokio::test(start_paused = true)]
async fn drifted_kernel_endpoint_is_restored() {
	let h = Harness::new(IceSettings::default());
	h.add_and_wait_published().await;
	h.inject(&remote_description(1));
	let agent = h.agents.latest().unwrap();
	agent.wait_for_connect().await;
	agent
		.emit(AgentEvent::SelectedPair {
			local: host("192.168.1.2", 51820),
			remote: host("10.0.0.5", 51820),
		})
		.await;
	agent.emit(AgentEvent::StateChanged(AgentState::Connected)).await;
	h.wait_for_state(ConnectionState::Connected).await;

	let mut drifted = h.device.get(INTERFACE).await.unwrap();
	drifted.peers[0].endpoint = Some("198.51.100.1:1234".parse().unwrap());
	h.discovery.sync(&drifted).await.unwrap();
	settle().await;

	let endpoint: SocketAddr = "10.0.0.5:51820".parse().unwrap();
	assert_eq!(
		h.device.endpoint_updates(INTERFACE, &h.peer()),
		vec![endpoint, endpoint]
	);
}

#[tokio::test(start_paused = true)]
async fn failed_endpoint_write_is_reported() {
	let h = Harness::new(IceSettings::default());
	let mut events = h.events.subscribe();
	h.device.set_fail_set(true);
	h.add_and_wait_published().await;
	h.inject(&remote_description(1));
	let agent = h.agents.latest().unwrap();
	agent.wait_for_connect().await;
	agent
		.emit(AgentEvent::SelectedPair {
			local: host("192.168.1.2", 51820),
			remote: host("10.0.0.5", 51820),
		})
		.await;
	agent.emit(AgentEvent::StateChanged(AgentState::Connected)).await;
	h.wait_for_state(ConnectionState::Connected).await;

	let warnings: Vec<_> = drain(&mut events)
		.into_iter()
		.filter(|e| matches!(e, Event::Warning { .. }))
		.collect();
	assert_eq!(warnings.len(), 1);

	// The next sync retries the write.
	h.device.set_fail_set(false);
	let live = h.device.get(INTERFACE).await.unwrap();
	h.discovery.sync(&live).await.unwrap();
	settle().await;
	assert_eq!(h.device.updates().len(), 2);
	let live = h.device.get(INTERFACE).await.unwrap();
	assert_eq!(
		live.peer(&h.peer()).and_then(|p| p.endpoint),
		Some("10.0.0.5:51820".parse().unwrap())
	);
}

#[tokio::test(start_paused = true)]
async fn restart_budget_ends_in_one_failure() {
	let settings = IceSettings {
		max_restarts: 2,
		check_timeout_secs: 1,
		..IceSettings::default()
	};
	let h = Harness::new(settings);
	let mut events = h.events.subscribe();
	h.add_and_wait_published().await;
	h.inject(&remote_description(1));

	let status = h.wait_for_state(ConnectionState::Failed).await;
	assert_eq!(status.restarts, 2);

	tokio::time::sleep(Duration::from_secs(120)).await;
	let events = drain(&mut events);
	assert_eq!(entered(&events, ConnectionState::Failed), 1);
	assert_eq!(h.agents.agents().len(), 3);
	assert!(h.agents.agents().iter().all(|a| a.is_closed()));
	assert!(h.device.updates().is_empty());

	// Descriptions arriving after failure are ignored.
	h.inject(&remote_description(2));
	settle().await;
	assert_eq!(h.agents.agents().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn agent_failure_restarts_with_new_credentials() {
	let h = Harness::new(IceSettings::default());
	h.add_and_wait_published().await;
	h.inject(&remote_description(1));
	let first = h.agents.latest().unwrap();
	first.wait_for_connect().await;

	first.emit(AgentEvent::StateChanged(AgentState::Failed)).await;
	let agents = h.agents.wait_for_agents(2).await;
	assert!(agents[0].is_closed());
	assert_ne!(agents[0].config().credentials, agents[1].config().credentials);

	let published = h.backend.wait_for_published(2).await;
	assert!(published.len() >= 2);
	let descriptions = h.published();
	let last = descriptions.last().unwrap();
	assert!(last.epoch > descriptions[0].epoch);
	assert_eq!(last.credentials, agents[1].config().credentials);

	let status = h.discovery.peer_status(&h.peer()).await.unwrap();
	assert_eq!(status.restarts, 1);
	assert_eq!(status.state, ConnectionState::Checking);
}

#[tokio::test(start_paused = true)]
async fn stale_and_duplicate_epochs_are_dropped() {
	let h = Harness::new(IceSettings::default());
	h.add_and_wait_published().await;

	h.inject(&remote_description(10));
	let first = h.agents.latest().unwrap();
	first.wait_for_connect().await;

	h.inject(&remote_description(10));
	h.inject(&remote_description(5));
	settle().await;
	assert_eq!(h.agents.agents().len(), 1);
	assert_eq!(first.connects().len(), 1);
	let status = h.discovery.peer_status(&h.peer()).await.unwrap();
	assert_eq!(status.remote_epoch, Some(10));

	// A newer epoch means the peer restarted; we follow without spending
	// our own restart budget.
	h.inject(&remote_description(11));
	let agents = h.agents.wait_for_agents(2).await;
	agents[1].wait_for_connect().await;
	assert!(first.is_closed());
	let status = h.discovery.peer_status(&h.peer()).await.unwrap();
	assert_eq!(status.remote_epoch, Some(11));
	assert_eq!(status.restarts, 0);
}

#[tokio::test(start_paused = true)]
async fn reply_is_sent_when_requested() {
	let h = Harness::new(IceSettings::default());
	h.add_and_wait_published().await;

	h.inject(&remote_description(1).with_need_reply(true));
	h.backend.wait_for_published(2).await;
	let published = h.published();
	assert_eq!(published[1].epoch, published[0].epoch);
	assert!(!published[1].need_reply);
}

#[tokio::test(start_paused = true)]
async fn publish_failures_are_retried() {
	let h = Harness::new(IceSettings::default());
	h.backend.set_fail_publish(true);
	assert!(h.discovery.add_peer(h.peer()).await.unwrap());

	tokio::time::sleep(Duration::from_secs(10)).await;
	assert!(h.backend.published().is_empty());

	h.backend.set_fail_publish(false);
	h.backend.wait_for_published(1).await;
}

#[tokio::test(start_paused = true)]
async fn agent_creation_failure_is_isolated() {
	let h = Harness::new(IceSettings::default());
	h.agents.set_fail_create(true);
	assert!(h.discovery.add_peer(h.peer()).await.unwrap());
	h.wait_for_state(ConnectionState::Failed).await;

	h.agents.set_fail_create(false);
	let other = WgPublicKey::random();
	assert!(h.discovery.add_peer(other).await.unwrap());
	let mut rx = h.discovery.watch_peer(&other).await.unwrap();
	rx.wait_for(|s| s.state == ConnectionState::Gathering)
		.await
		.unwrap();

	let failed = h.discovery.peer_status(&h.peer()).await.unwrap();
	assert_eq!(failed.state, ConnectionState::Failed);

	// A manual restart revives the failed session and is counted.
	h.discovery.restart_peer(&h.peer()).await.unwrap();
	let status = h.discovery.peer_status(&h.peer()).await.unwrap();
	assert_eq!(status.state, ConnectionState::Checking);
	assert_eq!(status.restarts, 1);
}

#[tokio::test(start_paused = true)]
async fn settings_change_rebuilds_unconnected_agents() {
	let h = Harness::new(IceSettings::default());
	h.add_and_wait_published().await;
	assert_eq!(h.agents.agents().len(), 1);

	// Only the restart budget changes: the agent is kept.
	h.discovery
		.update_settings(IceSettings {
			max_restarts: 9,
			..IceSettings::default()
		})
		.await
		.unwrap();
	settle().await;
	assert_eq!(h.agents.agents().len(), 1);

	h.discovery
		.update_settings(IceSettings {
			max_restarts: 9,
			failed_timeout_secs: 60,
			..IceSettings::default()
		})
		.await
		.unwrap();
	let agents = h.agents.wait_for_agents(2).await;
	assert_eq!(agents[1].config().settings.failed_timeout_secs, 60);
	let status = h.discovery.peer_status(&h.peer()).await.unwrap();
	assert_eq!(status.restarts, 0);
}

#[tokio::test(start_paused = true)]
async fn remove_peer_tears_down_the_session() {
	let h = Harness::new(IceSettings::default());
	let mut events = h.events.subscribe();
	h.add_and_wait_published().await;
	assert!(!h.discovery.add_peer(h.peer()).await.unwrap());
	assert!(h.backend.subscriptions().is_subscribed(h.local.public_key()));

	assert!(h.discovery.remove_peer(&h.peer()).await.unwrap());
	assert!(h.agents.latest().unwrap().is_closed());
	assert!(!h.backend.subscriptions().is_subscribed(h.local.public_key()));
	assert_eq!(entered(&drain(&mut events), ConnectionState::Closed), 1);

	assert!(!h.discovery.remove_peer(&h.peer()).await.unwrap());
	assert!(matches!(
		h.discovery.restart_peer(&h.peer()).await,
		Err(EpdiscError::PeerNotFound(_))
	));
	assert!(h.discovery.peers().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn closed_discovery_rejects_new_peers() {
	let h = Harness::new(IceSettings::default());
	h.add_and_wait_published().await;
	h.discovery.close().await.unwrap();

	assert!(h.agents.latest().unwrap().is_closed());
	assert!(h.discovery.status().await.is_empty());
	assert!(matches!(
		h.discovery.add_peer(WgPublicKey::random()).await,
		Err(EpdiscError::Closed)
	));
}

#[tokio::test(start_paused = true)]
async fn recovered_losses_do_not_exhaust_the_restart_budget() {
	let settings = IceSettings {
		max_restarts: 1,
		..IceSettings::default()
	};
	let h = Harness::new(settings);
	let mut events = h.events.subscribe();
	h.add_and_wait_published().await;
	h.inject(&remote_description(1));
	let agent = h.agents.latest().unwrap();
	agent.wait_for_connect().await;
	agent.emit(AgentEvent::StateChanged(AgentState::Connected)).await;
	h.wait_for_state(ConnectionState::Connected).await;

	for round in 0..3u64 {
		let agent = h.agents.latest().unwrap();
		agent.emit(AgentEvent::StateChanged(AgentState::Disconnected)).await;
		h.wait_for_state(ConnectionState::Checking).await;

		let agents = h.agents.wait_for_agents(round as usize + 2).await;
		h.inject(&remote_description(round + 2));
		let fresh = agents.last().unwrap();
		fresh.wait_for_connect().await;
		fresh.emit(AgentEvent::StateChanged(AgentState::Connected)).await;
		h.wait_for_state(ConnectionState::Connected).await;

		tokio::time::sleep(Duration::from_secs(3600)).await;
	}

	let status = h.discovery.peer_status(&h.peer()).await.unwrap();
	assert_eq!(status.state, ConnectionState::Connected);
	assert_eq!(status.restarts, 3);
	assert_eq!(entered(&drain(&mut events), ConnectionState::Failed), 0);
}

#[tokio::test(start_paused = true)]
async fn removal_tells_the_peer_we_are_gone() {
	let h = Harness::new(IceSettings::default());
	h.add_and_wait_published().await;
	h.inject(&remote_description(1));
	h.agents.latest().unwrap().wait_for_connect().await;

	assert!(h.discovery.remove_peer(&h.peer()).await.unwrap());
	let published = h.published();
	let last = published.last().unwrap();
	assert!(last.closing);
	assert!(last.candidates.is_empty());
	assert!(last.epoch > published[0].epoch);
	assert!(published[..published.len() - 1].iter().all(|d| !d.closing));
}

#[tokio::test(start_paused = true)]
async fn peer_closing_resets_to_a_fresh_round() {
	let h = Harness::new(IceSettings::default());
	h.add_and_wait_published().await;
	h.inject(&remote_description(1));
	let first = h.agents.latest().unwrap();
	first.wait_for_connect().await;
	first.emit(AgentEvent::StateChanged(AgentState::Connected)).await;
	h.wait_for_state(ConnectionState::Connected).await;

	h.inject(&SessionDescription::closing(2, Credentials::generate()));
	h.wait_for_state(ConnectionState::Gathering).await;
	let agents = h.agents.wait_for_agents(2).await;
	assert!(first.is_closed());

	// The peer comes back with a new round and is accepted as is.
	h.inject(&remote_description(3));
	agents[1].wait_for_connect().await;
	let status = h.discovery.peer_status(&h.peer()).await.unwrap();
	assert_eq!(status.state, ConnectionState::Checking);
	assert_eq!(status.remote_epoch, Some(3));
	assert_eq!(status.restarts, 0);
}
