// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::backend::{Backend, BackendConfig};
use crate::backends::inprocess::{InProcessBackend, InProcessHub};
use crate::backends::k8s::K8sBackend;
use crate::backends::manual::ManualBackend;
use crate::backends::mcast::McastBackend;
use crate::backends::relay::RelayBackend;
use crate::error::{Result, SignalingError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

pub type BackendFactory =
	Arc<dyn Fn(BackendConfig) -> BoxFuture<'static, Result<Arc<dyn Backend>>> + Send + Sync>;

struct Registration {
	description: String,
	factory: BackendFactory,
}

/// Maps URL schemes to backend constructors.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Default)]
pub struct BackendRegistry {
	factories: BTreeMap<String, Registration>,
	hub: Arc<InProcessHub>,
}

/// Splits `relay+https` into `("relay", Some("https"))`.
pub fn split_scheme(scheme: &str) -> (&str, Option<&str>) {
	match scheme.split_once('+') {
		Some((plugin, transport)) => (plugin, Some(transport)),
		None => (scheme, None),
	}
}

impl BackendRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_defaults() -> Self {
		let mut registry = Self::new();
		let hub = registry.hub.clone();

		registry.register(
			"inprocess",
			"in-process hub for tests and single-process setups",
			Arc::new(move |config| {
				let hub = hub.clone();
				async move {
					let backend = InProcessBackend::new(hub, &config);
					Ok(Arc::new(backend) as Arc<dyn Backend>)
				}
				.boxed()
			}),
		);
		registry.register(
			"manual",
			"records published envelopes and accepts injected ones",
			Arc::new(|config| {
				async move { Ok(Arc::new(ManualBackend::new(&config)) as Arc<dyn Backend>) }.boxed()
			}),
		);
		registry.register(
			"relay",
			"HTTP relay server with server-sent event subscriptions",
			Arc::new(|config| {
				async move { Ok(Arc::new(RelayBackend::new(config)?) as Arc<dyn Backend>) }.boxed()
			}),
		);
		registry.register(
			"mcast",
			"UDP multicast on the local network",
			Arc::new(|config| {
				async move { Ok(Arc::new(McastBackend::bind(config).await?) as Arc<dyn Backend>) }
					.boxed()
			}),
		);
		registry.register(
			"k8s",
			"Kubernetes node annotations",
			Arc::new(|config| {
				async move { Ok(Arc::new(K8sBackend::connect(config).await?) as Arc<dyn Backend>) }
					.boxed()
			}),
		);

		registry
	}

	pub fn register(
		&mut self,
		scheme: impl Into<String>,
		description: impl Into<String>,
		factory: BackendFactory,
	) {
		self.factories.insert(
			scheme.into(),
			Registration {
				description: description.into(),
				factory,
			},
		);
	}

	pub fn hub(&self) -> &Arc<InProcessHub> {
		&self.hub
	}

	/// Registered schemes and their descriptions.
	pub fn schemes(&self) -> Vec<(&str, &str)> {
		self.factories
			.iter()
			.map(|(scheme, r)| (scheme.as_str(), r.description.as_str()))
			.collect()
	}

	#[instrument(skip(self, config), fields(uri = %config.uri))]
	pub async fn create(&self, config: BackendConfig) -> Result<Arc<dyn Backend>> {
		let (plugin, _) = split_scheme(config.uri.scheme());
		let registration = self
			.factories
			.get(plugin)
			.ok_or_else(|| SignalingError::UnsupportedScheme(config.uri.scheme().to_string()))?;

		debug!(plugin, "creating signaling backend");
		(registration.factory)(config).await
	}
}

impl std::fmt::Debug for BackendRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BackendRegistry")
			.field("schemes", &self.factories.keys().collect::<Vec<_>>())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::BackendType;
	use url::Url;

	fn config(uri: &str) -> BackendConfig {
		BackendConfig::new(Url::parse(uri).unwrap())
	}

	#[test]
	fn splits_transport_suffix() {
		assert_eq!(split_scheme("relay+https"), ("relay", Some("https")));
		assert_eq!(split_scheme("inprocess"), ("inprocess", None));
	}

	#[test]
	fn defaults_are_registered() {
		let registry = BackendRegistry::with_defaults();
		let schemes: Vec<&str> = registry.schemes().into_iter().map(|(s, _)| s).collect();
		assert_eq!(schemes, vec!["inprocess", "k8s", "manual", "mcast", "relay"]);
	}

	#[tokio::test]
	async fn unknown_scheme_is_rejected() {
		let registry = BackendRegistry::with_defaults();
		let result = registry.create(config("grpc://localhost:8080")).await;
		assert!(matches!(result, Err(SignalingError::UnsupportedScheme(s)) if s == "grpc"));
	}

	#[tokio::test]
	async fn plugin_prefix_selects_factory() {
		let registry = BackendRegistry::with_defaults();
		let backend = registry.create(config("manual+test://")).await.unwrap();
		assert_eq!(backend.backend_type(), BackendType::Manual);
	}

	#[tokio::test]
	async fn relay_options_are_validated() {
		let registry = BackendRegistry::with_defaults();
		let result = registry.create(config("relay://example.com?timeout=soon")).await;
		assert!(matches!(
			result,
			Err(SignalingError::InvalidBackendOptions { .. })
		));
	}

	#[tokio::test]
	async fn custom_factory() {
		let mut registry = BackendRegistry::new();
		registry.register(
			"test",
			"test backend",
			Arc::new(|config| {
				async move { Ok(Arc::new(ManualBackend::new(&config)) as Arc<dyn Backend>) }.boxed()
			}),
		);
		assert!(registry.create(config("test://")).await.is_ok());
		assert!(registry.create(config("manual://")).await.is_err());
	}
}
