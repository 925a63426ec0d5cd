// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Kubernetes backend storing envelopes in Node annotations.
//!
//! Each node publishes into its own Node object under
//! `<prefix>/signaling-<channel>`, one annotation per peer pair, and watches
//! every Node for envelopes addressed to its subscribed keys.

use crate::backend::{Backend, BackendConfig, BackendType, MessageHandler};
use crate::codec::Envelope;
use crate::description::SessionDescription;
use crate::error::{Result, SignalingError};
use crate::subscriptions::{Dispatch, SubscriptionRegistry};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use loom_wgtunnel_common::{KeyPair, WgPrivateKey};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_ANNOTATION_PREFIX: &str = "wgtunnel.loom.dev";
const KEY_MARKER: &str = "signaling-";
const CHANNEL_HEX_LEN: usize = 40;
const FIELD_MANAGER: &str = "loom-wgtunnel";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KubeconfigSource {
	Infer,
	InCluster,
	Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct K8sOptions {
	pub node: String,
	pub kubeconfig: KubeconfigSource,
	pub annotation_prefix: String,
}

impl K8sOptions {
	pub fn from_config(config: &BackendConfig) -> Result<Self> {
		let scheme = config.uri.scheme();
		let node = config
			.query("node")
			.or_else(|| std::env::var("NODE_NAME").ok())
			.or_else(|| std::env::var("HOSTNAME").ok())
			.filter(|n| !n.is_empty())
			.ok_or_else(|| SignalingError::invalid_options(scheme, "node: unable to determine node name"))?;

		let kubeconfig = match config.query("kubeconfig").as_deref() {
			None | Some("") => KubeconfigSource::Infer,
			Some("incluster") => KubeconfigSource::InCluster,
			Some(path) => KubeconfigSource::Path(PathBuf::from(path)),
		};

		let annotation_prefix = config
			.query("annotation")
			.unwrap_or_else(|| DEFAULT_ANNOTATION_PREFIX.to_string());
		if annotation_prefix.is_empty() || annotation_prefix.contains('/') {
			return Err(SignalingError::invalid_options(
				scheme,
				format!("annotation: invalid prefix {}", annotation_prefix),
			));
		}

		Ok(Self {
			node,
			kubeconfig,
			annotation_prefix,
		})
	}

	pub fn annotation_key(&self, kp: &KeyPair) -> String {
		format!(
			"{}/{}{}",
			self.annotation_prefix,
			KEY_MARKER,
			kp.channel().short_hex(CHANNEL_HEX_LEN)
		)
	}

	fn is_signaling_key(&self, key: &str) -> bool {
		key.strip_prefix(&self.annotation_prefix)
			.and_then(|rest| rest.strip_prefix('/'))
			.is_some_and(|name| name.starts_with(KEY_MARKER))
	}

	/// Envelopes stored in a node's annotations, keyed by annotation name.
	pub fn envelopes<'a>(
		&'a self,
		annotations: &'a BTreeMap<String, String>,
	) -> impl Iterator<Item = (&'a str, &'a str, Option<Envelope>)> + 'a {
		annotations
			.iter()
			.filter(|(key, _)| self.is_signaling_key(key))
			.map(|(key, value)| (key.as_str(), value.as_str(), Envelope::from_json(value).ok()))
	}
}

async fn client(options: &K8sOptions) -> Result<Client> {
	let config = match &options.kubeconfig {
		KubeconfigSource::Infer => kube::Config::infer()
			.await
			.map_err(|e| SignalingError::Transport(format!("failed to infer kubeconfig: {}", e)))?,
		KubeconfigSource::InCluster => kube::Config::incluster()
			.map_err(|e| SignalingError::Transport(format!("in-cluster config: {}", e)))?,
		KubeconfigSource::Path(path) => {
			let kubeconfig = kube::config::Kubeconfig::read_from(path)
				.map_err(|e| SignalingError::Transport(format!("kubeconfig {}: {}", path.display(), e)))?;
			kube::Config::from_custom_kubeconfig(kubeconfig, &kube::config::KubeConfigOptions::default())
				.await
				.map_err(|e| SignalingError::Transport(format!("kubeconfig {}: {}", path.display(), e)))?
		}
	};
	Ok(Client::try_from(config)?)
}

struct Inner {
	options: K8sOptions,
	nodes: Api<Node>,
	subscriptions: SubscriptionRegistry,
	closed: AtomicBool,
}

pub struct K8sBackend {
	inner: Arc<Inner>,
	watcher: Mutex<Option<JoinHandle<()>>>,
}

impl K8sBackend {
	#[instrument(skip(config), fields(uri = %config.uri))]
	pub async fn connect(config: BackendConfig) -> Result<Self> {
		let options = K8sOptions::from_config(&config)?;
		let client = client(&options).await?;
		let nodes: Api<Node> = Api::all(client);

		// Fail early if the local node is not visible to us.
		nodes.get(&options.node).await?;
		info!(node = %options.node, "connected to kubernetes signaling backend");
		config.notify_ready(BackendType::K8s);

		Ok(Self {
			inner: Arc::new(Inner {
				options,
				nodes,
				subscriptions: SubscriptionRegistry::new(),
				closed: AtomicBool::new(false),
			}),
			watcher: Mutex::new(None),
		})
	}

	fn ensure_open(&self) -> Result<()> {
		if self.inner.closed.load(Ordering::Acquire) {
			return Err(SignalingError::Closed);
		}
		Ok(())
	}

	fn ensure_watcher(&self) {
		let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
		if watcher.as_ref().is_some_and(|w| !w.is_finished()) {
			return;
		}
		*watcher = Some(tokio::spawn(watch_nodes(self.inner.clone())));
	}

	fn stop_watcher(&self) {
		if let Some(handle) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
			handle.abort();
		}
	}
}

async fn watch_nodes(inner: Arc<Inner>) {
	let mut seen: HashMap<(String, String), String> = HashMap::new();
	let mut events = watcher(inner.nodes.clone(), watcher::Config::default())
		.default_backoff()
		.boxed();

	while let Some(event) = events.next().await {
		if inner.closed.load(Ordering::Acquire) {
			return;
		}
		match event {
			Ok(watcher::Event::Apply(node)) | Ok(watcher::Event::InitApply(node)) => {
				scan_node(&inner, &node, &mut seen);
			}
			Ok(watcher::Event::Delete(node)) => {
				let name = node.metadata.name.unwrap_or_default();
				seen.retain(|(node_name, _), _| node_name != &name);
			}
			Ok(_) => {}
			Err(e) => warn!(error = %e, "node watch failed"),
		}
	}
	debug!("node watch ended");
}

fn scan_node(inner: &Inner, node: &Node, seen: &mut HashMap<(String, String), String>) {
	let Some(name) = node.metadata.name.as_deref() else {
		return;
	};
	let Some(annotations) = node.metadata.annotations.as_ref() else {
		return;
	};
	for (key, value, envelope) in inner.options.envelopes(annotations) {
		let seen_key = (name.to_string(), key.to_string());
		if seen.get(&seen_key).is_some_and(|v| v == value) {
			continue;
		}

		let Some(envelope) = envelope else {
			debug!(node = name, key, "ignoring malformed annotation");
			seen.insert(seen_key, value.to_string());
			continue;
		};
		// Envelopes for keys nobody subscribed yet stay eligible for a later scan.
		if !matches!(inner.subscriptions.dispatch(&envelope), Dispatch::NotSubscribed) {
			seen.insert(seen_key, value.to_string());
		}
	}
}

#[async_trait]
impl Backend for K8sBackend {
	#[instrument(skip_all, fields(peer = %kp.theirs, epoch = description.epoch))]
	async fn publish(&self, kp: &KeyPair, description: &SessionDescription) -> Result<()> {
		self.ensure_open()?;
		let envelope = Envelope::seal(description, kp)?;
		let mut annotations = serde_json::Map::new();
		annotations.insert(
			self.inner.options.annotation_key(kp),
			serde_json::Value::String(envelope.to_json()?),
		);
		let patch = serde_json::json!({ "metadata": { "annotations": annotations } });

		let params = PatchParams {
			field_manager: Some(FIELD_MANAGER.to_string()),
			..PatchParams::default()
		};
		self.inner
			.nodes
			.patch(&self.inner.options.node, &params, &Patch::Merge(&patch))
			.await?;
		Ok(())
	}

	async fn subscribe(&self, kp: &KeyPair, handler: Arc<dyn MessageHandler>) -> Result<bool> {
		self.ensure_open()?;
		let first = self.inner.subscriptions.subscribe(kp, handler);
		self.ensure_watcher();
		Ok(first)
	}

	async fn subscribe_all(
		&self,
		ours: &WgPrivateKey,
		handler: Arc<dyn MessageHandler>,
	) -> Result<bool> {
		self.ensure_open()?;
		let first = self.inner.subscriptions.subscribe_all(ours, handler);
		self.ensure_watcher();
		Ok(first)
	}

	async fn unsubscribe(&self, kp: &KeyPair) -> Result<bool> {
		self.ensure_open()?;
		let last = self.inner.subscriptions.unsubscribe(kp);
		if self.inner.subscriptions.is_empty() {
			self.stop_watcher();
		}
		Ok(last)
	}

	async fn close(&self) -> Result<()> {
		if self.inner.closed.swap(true, Ordering::AcqRel) {
			return Err(SignalingError::Closed);
		}
		self.stop_watcher();
		self.inner.subscriptions.clear();
		Ok(())
	}

	fn backend_type(&self) -> BackendType {
		BackendType::K8s
	}
}

impl Drop for K8sBackend {
	fn drop(&mut self) {
		self.stop_watcher();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::description::Credentials;
	use loom_wgtunnel_common::WgKeyPair;
	use url::Url;

	fn options(uri: &str) -> Result<K8sOptions> {
		K8sOptions::from_config(&BackendConfig::new(Url::parse(uri).unwrap()))
	}

	#[test]
	fn parses_options() {
		let opts = options("k8s://?node=worker-1&kubeconfig=/etc/kube/config&annotation=example.com").unwrap();
		assert_eq!(opts.node, "worker-1");
		assert_eq!(
			opts.kubeconfig,
			KubeconfigSource::Path(PathBuf::from("/etc/kube/config"))
		);
		assert_eq!(opts.annotation_prefix, "example.com");

		let opts = options("k8s://?node=worker-1&kubeconfig=incluster").unwrap();
		assert_eq!(opts.kubeconfig, KubeconfigSource::InCluster);
		assert_eq!(opts.annotation_prefix, DEFAULT_ANNOTATION_PREFIX);
	}

	#[test]
	fn rejects_bad_prefix() {
		assert!(matches!(
			options("k8s://?node=n&annotation=a/b"),
			Err(SignalingError::InvalidBackendOptions { .. })
		));
	}

	#[test]
	fn annotation_key_is_shared_by_both_peers() {
		let opts = options("k8s://?node=n").unwrap();
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let ab = opts.annotation_key(&a.pair_with(*b.public_key()));
		let ba = opts.annotation_key(&b.pair_with(*a.public_key()));
		assert_eq!(ab, ba);
		let name = ab.split_once('/').unwrap().1;
		assert!(name.len() <= 63);
		assert!(name.starts_with("signaling-"));
	}

	#[test]
	fn finds_envelopes_in_annotations() {
		let opts = options("k8s://?node=n").unwrap();
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let kp = a.pair_with(*b.public_key());
		let desc = SessionDescription::new(1, Credentials::generate(), vec![]);
		let envelope = Envelope::seal(&desc, &kp).unwrap();

		let mut annotations = BTreeMap::new();
		annotations.insert(opts.annotation_key(&kp), envelope.to_json().unwrap());
		annotations.insert(
			format!("{}/signaling-broken", DEFAULT_ANNOTATION_PREFIX),
			"{".to_string(),
		);
		annotations.insert("node.alpha.kubernetes.io/ttl".to_string(), "0".to_string());

		let found: Vec<_> = opts.envelopes(&annotations).collect();
		assert_eq!(found.len(), 2);
		assert_eq!(
			found.iter().filter_map(|(_, _, e)| e.clone()).collect::<Vec<_>>(),
			vec![envelope]
		);
	}
}
