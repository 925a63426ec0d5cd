// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! UDP multicast backend for peers on the same network segment.
//!
//! Every envelope is sent to the group; receivers keep only envelopes
//! addressed to keys they subscribed. The group port is bound with address
//! reuse so several instances on one host can share it.

use crate::backend::{Backend, BackendConfig, BackendType, MessageHandler};
use crate::codec::Envelope;
use crate::description::SessionDescription;
use crate::error::{Result, SignalingError};
use crate::subscriptions::SubscriptionRegistry;
use async_trait::async_trait;
use loom_wgtunnel_common::{KeyPair, WgPrivateKey};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_PORT: u16 = 7946;
const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McastOptions {
	pub group: SocketAddrV4,
	pub interface: Ipv4Addr,
	pub loopback: bool,
	pub ttl: u32,
	pub community: Option<String>,
}

impl McastOptions {
	pub fn from_config(config: &BackendConfig) -> Result<Self> {
		let scheme = config.uri.scheme();
		let host = config
			.uri
			.host_str()
			.ok_or_else(|| SignalingError::invalid_options(scheme, "missing multicast group"))?;
		let group: Ipv4Addr = host.parse().map_err(|_| {
			SignalingError::invalid_options(scheme, format!("group {} is not an IPv4 address", host))
		})?;
		if !group.is_multicast() {
			return Err(SignalingError::invalid_options(
				scheme,
				format!("{} is not a multicast address", group),
			));
		}
		let port = config.uri.port().unwrap_or(DEFAULT_PORT);

		let interface = match config.query("interface") {
			None => Ipv4Addr::UNSPECIFIED,
			Some(addr) => addr.parse().map_err(|_| {
				SignalingError::invalid_options(scheme, format!("interface: invalid address {}", addr))
			})?,
		};
		let loopback = config
			.query_bool("loopback")
			.map_err(|e| SignalingError::invalid_options(scheme, e))?
			.unwrap_or(true);
		let ttl = match config.query("ttl") {
			None => 1,
			Some(ttl) => ttl.parse().map_err(|_| {
				SignalingError::invalid_options(scheme, format!("ttl: invalid value {}", ttl))
			})?,
		};

		Ok(Self {
			group: SocketAddrV4::new(group, port),
			interface,
			loopback,
			ttl,
			community: config.community.clone(),
		})
	}
}

/// Wire form of one multicast datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datagram {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub community: Option<String>,
	pub envelope: Envelope,
}

impl Datagram {
	pub fn encode(&self) -> Result<Vec<u8>> {
		Ok(serde_json::to_vec(self)?)
	}

	pub fn decode(bytes: &[u8]) -> Result<Self> {
		Ok(serde_json::from_slice(bytes)?)
	}

	pub fn accepted_by(&self, community: Option<&str>) -> bool {
		self.community.as_deref() == community
	}
}

/// Binds `0.0.0.0:port` with SO_REUSEADDR (and SO_REUSEPORT on unix).
fn bind_shared(port: u16) -> std::io::Result<UdpSocket> {
	let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
	socket.set_reuse_address(true)?;
	#[cfg(unix)]
	socket.set_reuse_port(true)?;
	socket.set_nonblocking(true)?;
	let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
	socket.bind(&addr.into())?;
	UdpSocket::from_std(socket.into())
}

pub struct McastBackend {
	options: McastOptions,
	socket: Arc<UdpSocket>,
	subscriptions: Arc<SubscriptionRegistry>,
	receiver: Mutex<Option<JoinHandle<()>>>,
	closed: AtomicBool,
}

impl McastBackend {
	#[instrument(skip(config), fields(uri = %config.uri))]
	pub async fn bind(config: BackendConfig) -> Result<Self> {
		let options = McastOptions::from_config(&config)?;

		let socket = bind_shared(options.group.port())?;
		socket.join_multicast_v4(*options.group.ip(), options.interface)?;
		socket.set_multicast_loop_v4(options.loopback)?;
		socket.set_multicast_ttl_v4(options.ttl)?;
		let socket = Arc::new(socket);

		let subscriptions = Arc::new(SubscriptionRegistry::new());
		let receiver = tokio::spawn(receive_loop(
			socket.clone(),
			subscriptions.clone(),
			options.community.clone(),
		));

		info!(group = %options.group, "joined signaling multicast group");
		config.notify_ready(BackendType::Mcast);

		Ok(Self {
			options,
			socket,
			subscriptions,
			receiver: Mutex::new(Some(receiver)),
			closed: AtomicBool::new(false),
		})
	}

	pub fn options(&self) -> &McastOptions {
		&self.options
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(SignalingError::Closed);
		}
		Ok(())
	}

	fn stop_receiver(&self) {
		if let Some(handle) = self.receiver.lock().unwrap_or_else(|e| e.into_inner()).take() {
			handle.abort();
		}
	}
}

async fn receive_loop(
	socket: Arc<UdpSocket>,
	subscriptions: Arc<SubscriptionRegistry>,
	community: Option<String>,
) {
	let mut buf = vec![0u8; MAX_DATAGRAM];
	loop {
		let (len, from) = match socket.recv_from(&mut buf).await {
			Ok(received) => received,
			Err(e) => {
				warn!(error = %e, "multicast receive failed");
				tokio::time::sleep(std::time::Duration::from_millis(250)).await;
				continue;
			}
		};
		handle_datagram(&buf[..len], from, &subscriptions, community.as_deref());
	}
}

fn handle_datagram(
	bytes: &[u8],
	from: SocketAddr,
	subscriptions: &SubscriptionRegistry,
	community: Option<&str>,
) {
	let datagram = match Datagram::decode(bytes) {
		Ok(datagram) => datagram,
		Err(e) => {
			debug!(%from, error = %e, "ignoring malformed datagram");
			return;
		}
	};
	if !datagram.accepted_by(community) {
		return;
	}
	subscriptions.dispatch(&datagram.envelope);
}

#[async_trait]
impl Backend for McastBackend {
	#[instrument(skip_all, fields(peer = %kp.theirs, epoch = description.epoch))]
	async fn publish(&self, kp: &KeyPair, description: &SessionDescription) -> Result<()> {
		self.ensure_open()?;
		let datagram = Datagram {
			community: self.options.community.clone(),
			envelope: Envelope::seal(description, kp)?,
		};
		let bytes = datagram.encode()?;
		self.socket.send_to(&bytes, self.options.group).await?;
		Ok(())
	}

	async fn subscribe(&self, kp: &KeyPair, handler: Arc<dyn MessageHandler>) -> Result<bool> {
		self.ensure_open()?;
		Ok(self.subscriptions.subscribe(kp, handler))
	}

	async fn subscribe_all(
		&self,
		ours: &WgPrivateKey,
		handler: Arc<dyn MessageHandler>,
	) -> Result<bool> {
		self.ensure_open()?;
		Ok(self.subscriptions.subscribe_all(ours, handler))
	}

	async fn unsubscribe(&self, kp: &KeyPair) -> Result<bool> {
		self.ensure_open()?;
		Ok(self.subscriptions.unsubscribe(kp))
	}

	async fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Err(SignalingError::Closed);
		}
		self.stop_receiver();
		if let Err(e) = self
			.socket
			.leave_multicast_v4(*self.options.group.ip(), self.options.interface)
		{
			debug!(error = %e, "failed to leave multicast group");
		}
		self.subscriptions.clear();
		Ok(())
	}

	fn backend_type(&self) -> BackendType {
		BackendType::Mcast
	}
}

impl Drop for McastBackend {
	fn drop(&mut self) {
		self.stop_receiver();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::ChannelHandler;
	use crate::description::Credentials;
	use loom_wgtunnel_common::WgKeyPair;
	use url::Url;

	fn options(uri: &str) -> Result<McastOptions> {
		McastOptions::from_config(&BackendConfig::new(Url::parse(uri).unwrap()))
	}

	#[tokio::test]
	async fn group_port_can_be_shared() {
		let first = bind_shared(0).unwrap();
		let port = first.local_addr().unwrap().port();
		let second = bind_shared(port).unwrap();
		assert_eq!(second.local_addr().unwrap().port(), port);
	}

	#[test]
	fn parses_group_and_options() {
		let opts = options("mcast://239.0.0.1:9000?interface=192.168.1.2&loopback=false&ttl=4").unwrap();
		assert_eq!(opts.group, "239.0.0.1:9000".parse().unwrap());
		assert_eq!(opts.interface, Ipv4Addr::new(192, 168, 1, 2));
		assert!(!opts.loopback);
		assert_eq!(opts.ttl, 4);
	}

	#[test]
	fn defaults() {
		let opts = options("mcast://239.0.0.1").unwrap();
		assert_eq!(opts.group.port(), DEFAULT_PORT);
		assert_eq!(opts.interface, Ipv4Addr::UNSPECIFIED);
		assert!(opts.loopback);
		assert_eq!(opts.ttl, 1);
	}

	#[test]
	fn rejects_unicast_group() {
		assert!(matches!(
			options("mcast://10.0.0.1:7946"),
			Err(SignalingError::InvalidBackendOptions { .. })
		));
		assert!(options("mcast://239.0.0.1?ttl=many").is_err());
	}

	#[tokio::test]
	async fn datagrams_filter_by_community_and_recipient() {
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let registry = SubscriptionRegistry::new();
		let (handler, mut rx) = ChannelHandler::channel(4);
		registry.subscribe(&b.pair_with(*a.public_key()), handler);

		let desc = SessionDescription::new(2, Credentials::generate(), vec![]);
		let envelope = Envelope::seal(&desc, &a.pair_with(*b.public_key())).unwrap();
		let from: SocketAddr = "10.0.0.9:7946".parse().unwrap();

		let foreign = Datagram {
			community: Some("other".to_string()),
			envelope: envelope.clone(),
		};
		handle_datagram(&foreign.encode().unwrap(), from, &registry, Some("ours"));
		assert!(rx.try_recv().is_err());

		handle_datagram(b"not json", from, &registry, Some("ours"));
		assert!(rx.try_recv().is_err());

		let ours = Datagram {
			community: Some("ours".to_string()),
			envelope,
		};
		handle_datagram(&ours.encode().unwrap(), from, &registry, Some("ours"));
		assert_eq!(rx.recv().await.unwrap().description, desc);
	}
}
