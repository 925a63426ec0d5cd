// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_wgtunnel_common::WgPublicKey;
use loom_wgtunnel_signaling::SignalingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IceError {
	#[error("ICE agent error: {0}")]
	Agent(String),

	#[error("invalid ICE server URL {url}: {reason}")]
	InvalidUrl { url: String, reason: String },

	#[error("invalid candidate: {0}")]
	InvalidCandidate(String),

	#[error("invalid port range {min}-{max}")]
	InvalidPortRange { min: u16, max: u16 },

	#[error("ICE agent is closed")]
	Closed,
}

#[derive(Debug, Error)]
pub enum DeviceError {
	#[error("interface not found: {0}")]
	NotFound(String),

	#[error("`{command}` exited with {status}: {stderr}")]
	Command {
		command: String,
		status: String,
		stderr: String,
	},

	#[error("failed to parse device state: {0}")]
	Parse(String),

	#[error("device update rejected: {0}")]
	Rejected(String),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EpdiscError {
	#[error("peer not found: {0}")]
	PeerNotFound(WgPublicKey),

	#[error("peer session has stopped")]
	SessionClosed,

	#[error("endpoint discovery is closed")]
	Closed,

	#[error("ICE error: {0}")]
	Ice(#[from] IceError),

	#[error("device error: {0}")]
	Device(#[from] DeviceError),

	#[error("signaling error: {0}")]
	Signaling(#[from] SignalingError),
}

pub type Result<T> = std::result::Result<T, EpdiscError>;
