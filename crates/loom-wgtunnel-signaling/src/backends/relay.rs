// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP relay client.
//!
//! Envelopes are posted to `/v1/signaling/envelopes`. Each subscribed key has a
//! receive worker reading server-sent events from
//! `/v1/signaling/subscribe/{recipient}`; the worker reconnects with backoff
//! whenever the stream ends.

use crate::backend::{Backend, BackendConfig, BackendType, MessageHandler};
use crate::codec::Envelope;
use crate::description::SessionDescription;
use crate::error::{Result, SignalingError};
use crate::registry::split_scheme;
use crate::subscriptions::SubscriptionRegistry;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use loom_wgtunnel_common::{Backoff, KeyPair, WgPrivateKey, WgPublicKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_PATH: &str = "v1/health";
const PUBLISH_PATH: &str = "v1/signaling/envelopes";
const SUBSCRIBE_PATH: &str = "v1/signaling/subscribe/";
const COMMUNITY_HEADER: &str = "X-Loom-Community";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
	pub base: Url,
	pub timeout: Duration,
	pub community: Option<String>,
}

impl RelayOptions {
	pub fn from_config(config: &BackendConfig) -> Result<Self> {
		let scheme = config.uri.scheme();
		let insecure = config
			.query_bool("insecure")
			.map_err(|e| SignalingError::invalid_options(scheme, e))?
			.unwrap_or(false);
		let timeout = match config.query("timeout") {
			None => DEFAULT_TIMEOUT,
			Some(secs) => secs
				.parse::<u64>()
				.map(Duration::from_secs)
				.map_err(|_| {
					SignalingError::invalid_options(scheme, format!("timeout: invalid seconds {}", secs))
				})?,
		};
		let base = base_url(&config.uri, insecure)?;
		Ok(Self {
			base,
			timeout,
			community: config.community.clone(),
		})
	}

	fn endpoint(&self, path: &str) -> Result<Url> {
		self.base
			.join(path)
			.map_err(|e| SignalingError::Transport(format!("invalid relay path {}: {}", path, e)))
	}

	pub fn publish_url(&self) -> Result<Url> {
		self.endpoint(PUBLISH_PATH)
	}

	pub fn subscribe_url(&self, recipient: &WgPublicKey) -> Result<Url> {
		self.endpoint(&format!("{}{}", SUBSCRIBE_PATH, recipient.to_hex()))
	}

	pub fn health_url(&self) -> Result<Url> {
		self.endpoint(HEALTH_PATH)
	}
}

/// Maps `relay[+transport]://host[:port][/path]` to the HTTP base URL.
fn base_url(uri: &Url, insecure: bool) -> Result<Url> {
	let scheme = uri.scheme();
	let transport = match split_scheme(scheme).1 {
		Some(t @ ("http" | "https")) => t,
		Some(other) => {
			return Err(SignalingError::invalid_options(
				scheme,
				format!("unsupported transport {}", other),
			))
		}
		None if insecure => "http",
		None => "https",
	};
	let host = uri
		.host_str()
		.filter(|h| !h.is_empty())
		.ok_or_else(|| SignalingError::invalid_options(scheme, "missing relay host"))?;

	let mut base = format!("{}://{}", transport, host);
	if let Some(port) = uri.port() {
		base.push_str(&format!(":{}", port));
	}
	base.push_str(uri.path().trim_end_matches('/'));
	base.push('/');

	Url::parse(&base).map_err(|source| SignalingError::InvalidUrl { url: base, source })
}

struct Inner {
	options: RelayOptions,
	client: reqwest::Client,
	subscriptions: SubscriptionRegistry,
	closed: AtomicBool,
}

pub struct RelayBackend {
	inner: Arc<Inner>,
	workers: Mutex<HashMap<WgPublicKey, JoinHandle<()>>>,
	health: Mutex<Option<JoinHandle<()>>>,
}

fn user_agent() -> String {
	format!("loom-wgtunnel/{}", env!("CARGO_PKG_VERSION"))
}

impl RelayBackend {
	pub fn new(config: BackendConfig) -> Result<Self> {
		let options = RelayOptions::from_config(&config)?;
		let client = reqwest::Client::builder()
			.user_agent(user_agent())
			.connect_timeout(options.timeout)
			.build()?;

		let inner = Arc::new(Inner {
			options,
			client,
			subscriptions: SubscriptionRegistry::new(),
			closed: AtomicBool::new(false),
		});

		let health = tokio::spawn(wait_until_healthy(inner.clone(), config));

		Ok(Self {
			inner,
			workers: Mutex::new(HashMap::new()),
			health: Mutex::new(Some(health)),
		})
	}

	pub fn options(&self) -> &RelayOptions {
		&self.inner.options
	}

	fn ensure_open(&self) -> Result<()> {
		if self.inner.closed.load(Ordering::Acquire) {
			return Err(SignalingError::Closed);
		}
		Ok(())
	}

	fn start_worker(&self, recipient: WgPublicKey) {
		let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
		if workers.get(&recipient).is_some_and(|w| !w.is_finished()) {
			return;
		}
		let handle = tokio::spawn(receive_loop(self.inner.clone(), recipient));
		workers.insert(recipient, handle);
	}

	fn stop_worker(&self, recipient: &WgPublicKey) {
		let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
		if let Some(handle) = workers.remove(recipient) {
			handle.abort();
		}
	}
}

async fn wait_until_healthy(inner: Arc<Inner>, config: BackendConfig) {
	let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
	loop {
		if inner.closed.load(Ordering::Acquire) {
			return;
		}
		match probe_health(&inner).await {
			Ok(()) => {
				info!(relay = %inner.options.base, "signaling relay reachable");
				config.notify_ready(BackendType::Relay);
				return;
			}
			Err(e) => {
				let delay = backoff.next_delay();
				warn!(relay = %inner.options.base, error = %e, ?delay, "signaling relay unreachable");
				tokio::time::sleep(delay).await;
			}
		}
	}
}

async fn probe_health(inner: &Inner) -> Result<()> {
	inner
		.client
		.get(inner.options.health_url()?)
		.timeout(inner.options.timeout)
		.send()
		.await?
		.error_for_status()?;
	Ok(())
}

#[instrument(skip(inner), fields(recipient = %recipient.short()))]
async fn receive_loop(inner: Arc<Inner>, recipient: WgPublicKey) {
	let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
	loop {
		if inner.closed.load(Ordering::Acquire) || !inner.subscriptions.is_subscribed(&recipient) {
			debug!("receive worker exiting");
			return;
		}

		match stream_envelopes(&inner, &recipient, &mut backoff).await {
			Ok(()) => debug!("subscription stream ended"),
			Err(e) => warn!(error = %e, "subscription stream failed"),
		}

		let delay = backoff.next_delay();
		tokio::time::sleep(delay).await;
	}
}

async fn stream_envelopes(
	inner: &Inner,
	recipient: &WgPublicKey,
	backoff: &mut Backoff,
) -> Result<()> {
	let url = inner.options.subscribe_url(recipient)?;
	let mut request = inner
		.client
		.get(url)
		.header(reqwest::header::ACCEPT, "text/event-stream");
	if let Some(community) = &inner.options.community {
		request = request.header(COMMUNITY_HEADER, community);
	}
	let response = request.send().await?.error_for_status()?;

	debug!("subscription stream connected");
	backoff.reset();

	let mut events = response.bytes_stream().eventsource().boxed();
	while let Some(event) = events.next().await {
		let event = event.map_err(|e| SignalingError::Transport(e.to_string()))?;
		if !(event.event.is_empty() || event.event == "message" || event.event == "envelope") {
			continue;
		}
		match Envelope::from_json(&event.data) {
			Ok(envelope) if &envelope.recipient == recipient => {
				inner.subscriptions.dispatch(&envelope);
			}
			Ok(envelope) => {
				debug!(recipient = %envelope.recipient, "ignoring envelope for another recipient");
			}
			Err(e) => debug!(error = %e, "ignoring malformed envelope"),
		}
	}
	Ok(())
}

#[async_trait]
impl Backend for RelayBackend {
	#[instrument(skip_all, fields(peer = %kp.theirs, epoch = description.epoch))]
	async fn publish(&self, kp: &KeyPair, description: &SessionDescription) -> Result<()> {
		self.ensure_open()?;
		let envelope = Envelope::seal(description, kp)?;
		let mut request = self
			.inner
			.client
			.post(self.inner.options.publish_url()?)
			.timeout(self.inner.options.timeout)
			.json(&envelope);
		if let Some(community) = &self.inner.options.community {
			request = request.header(COMMUNITY_HEADER, community);
		}
		request.send().await?.error_for_status()?;
		debug!("published envelope to relay");
		Ok(())
	}

	async fn subscribe(&self, kp: &KeyPair, handler: Arc<dyn MessageHandler>) -> Result<bool> {
		self.ensure_open()?;
		let first = self.inner.subscriptions.subscribe(kp, handler);
		self.start_worker(kp.ours.public_key());
		Ok(first)
	}

	async fn subscribe_all(
		&self,
		ours: &WgPrivateKey,
		handler: Arc<dyn MessageHandler>,
	) -> Result<bool> {
		self.ensure_open()?;
		let first = self.inner.subscriptions.subscribe_all(ours, handler);
		self.start_worker(ours.public_key());
		Ok(first)
	}

	async fn unsubscribe(&self, kp: &KeyPair) -> Result<bool> {
		self.ensure_open()?;
		let last = self.inner.subscriptions.unsubscribe(kp);
		if last {
			self.stop_worker(&kp.ours.public_key());
		}
		Ok(last)
	}

	async fn close(&self) -> Result<()> {
		if self.inner.closed.swap(true, Ordering::AcqRel) {
			return Err(SignalingError::Closed);
		}
		let workers: Vec<JoinHandle<()>> = self
			.workers
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.drain()
			.map(|(_, handle)| handle)
			.collect();
		for handle in workers {
			handle.abort();
		}
		if let Some(health) = self.health.lock().unwrap_or_else(|e| e.into_inner()).take() {
			health.abort();
		}
		self.inner.subscriptions.clear();
		Ok(())
	}

	fn backend_type(&self) -> BackendType {
		BackendType::Relay
	}
}

impl Drop for RelayBackend {
	fn drop(&mut self) {
		self.inner.closed.store(true, Ordering::Release);
		for (_, handle) in self
			.workers
			.get_mut()
			.unwrap_or_else(|e| e.into_inner())
			.drain()
		{
			handle.abort();
		}
		if let Some(health) = self.health.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
			health.abort();
		}
	}
}
