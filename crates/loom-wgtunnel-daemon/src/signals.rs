// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! OS signals relevant to the daemon loop.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
	Terminate,
	Reload,
}

/// SIGINT and SIGTERM terminate, SIGHUP reloads. Outside unix only Ctrl-C
/// is observed.
pub struct Signals {
	#[cfg(unix)]
	inner: Option<UnixSignals>,
	#[cfg(not(unix))]
	enabled: bool,
}

#[cfg(unix)]
struct UnixSignals {
	interrupt: tokio::signal::unix::Signal,
	terminate: tokio::signal::unix::Signal,
	hangup: tokio::signal::unix::Signal,
}

impl Signals {
	pub fn install() -> std::io::Result<Self> {
		#[cfg(unix)]
		{
			use tokio::signal::unix::{signal, SignalKind};
			Ok(Self {
				inner: Some(UnixSignals {
					interrupt: signal(SignalKind::interrupt())?,
					terminate: signal(SignalKind::terminate())?,
					hangup: signal(SignalKind::hangup())?,
				}),
			})
		}
		#[cfg(not(unix))]
		{
			Ok(Self { enabled: true })
		}
	}

	/// Never yields.
	pub fn disabled() -> Self {
		#[cfg(unix)]
		{
			Self { inner: None }
		}
		#[cfg(not(unix))]
		{
			Self { enabled: false }
		}
	}

	pub async fn recv(&mut self) -> SignalEvent {
		#[cfg(unix)]
		{
			let Some(inner) = self.inner.as_mut() else {
				return std::future::pending().await;
			};
			tokio::select! {
				_ = inner.interrupt.recv() => SignalEvent::Terminate,
				_ = inner.terminate.recv() => SignalEvent::Terminate,
				_ = inner.hangup.recv() => SignalEvent::Reload,
			}
		}
		#[cfg(not(unix))]
		{
			if !self.enabled || tokio::signal::ctrl_c().await.is_err() {
				return std::future::pending().await;
			}
			SignalEvent::Terminate
		}
	}
}
