// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Polls the WireGuard device collaborator for interface and peer changes.

use loom_wgtunnel_common::WgPublicKey;
use loom_wgtunnel_epdisc::{Device, WireGuardDevice};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// The parts of an interface whose change should trigger a sync. Endpoints
/// are left out since sessions write them.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InterfaceShape {
	public_key: Option<WgPublicKey>,
	listen_port: Option<u16>,
	peers: BTreeSet<WgPublicKey>,
}

impl From<&Device> for InterfaceShape {
	fn from(device: &Device) -> Self {
		Self {
			public_key: device.public_key,
			listen_port: device.listen_port,
			peers: device.peers.iter().map(|p| p.public_key).collect(),
		}
	}
}

type Snapshot = BTreeMap<String, InterfaceShape>;

async fn snapshot(device: &dyn WireGuardDevice) -> Option<Snapshot> {
	let names = match device.list().await {
		Ok(names) => names,
		Err(e) => {
			warn!(error = %e, "failed to list interfaces");
			return None;
		}
	};
	let mut snapshot = Snapshot::new();
	for name in names {
		match device.get(&name).await {
			Ok(state) => {
				snapshot.insert(name, InterfaceShape::from(&state));
			}
			// Interface went away between list and get.
			Err(e) => debug!(interface = %name, error = %e, "failed to read interface"),
		}
	}
	Some(snapshot)
}

/// Starts the watcher task. A notification is sent on `changes` each time
/// the interface set or their peers differ from the previous poll;
/// notifications coalesce while the receiver is busy.
pub fn spawn(
	device: Arc<dyn WireGuardDevice>,
	period: Duration,
	changes: mpsc::Sender<()>,
	mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = interval(period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
		let mut previous: Option<Snapshot> = None;

		loop {
			tokio::select! {
				biased;

				_ = shutdown.changed() => {
					debug!("interface watcher shutting down");
					break;
				}

				_ = ticker.tick() => {
					let Some(current) = snapshot(device.as_ref()).await else {
						continue;
					};
					let changed = previous.as_ref().is_some_and(|p| p != &current);
					previous = Some(current);
					if !changed {
						trace!("no interface changes");
						continue;
					}
					debug!("interface change detected");
					if let Err(mpsc::error::TrySendError::Closed(())) = changes.try_send(()) {
						break;
					}
				}
			}
		}
	})
}
