// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("invalid nonce length: expected 24 bytes, got {0}")]
	InvalidNonce(usize),

	#[error("envelope keys do not match key pair")]
	KeyPairMismatch,

	#[error("failed to decrypt envelope")]
	DecryptFailed,

	#[error("failed to encrypt envelope")]
	EncryptFailed,

	#[error("invalid session description: {0}")]
	Decode(#[source] serde_json::Error),

	#[error("failed to encode session description: {0}")]
	Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SignalingError {
	#[error("backend is closed")]
	Closed,

	#[error("unsupported backend scheme: {0}")]
	UnsupportedScheme(String),

	#[error("invalid options for {scheme} backend: {reason}")]
	InvalidBackendOptions { scheme: String, reason: String },

	#[error("invalid backend URL {url}: {source}")]
	InvalidUrl {
		url: String,
		#[source]
		source: url::ParseError,
	},

	#[error("no usable signaling backends")]
	NoBackends,

	#[error("codec error: {0}")]
	Codec(#[from] CodecError),

	#[error("transport error: {0}")]
	Transport(String),

	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("kubernetes error: {0}")]
	Kube(#[from] kube::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("serialization error: {0}")]
	Json(#[from] serde_json::Error),
}

impl SignalingError {
	pub fn invalid_options(scheme: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::InvalidBackendOptions {
			scheme: scheme.into(),
			reason: reason.into(),
		}
	}

	/// Transport failures are expected to clear up on retry.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			SignalingError::Transport(_)
				| SignalingError::Http(_)
				| SignalingError::Kube(_)
				| SignalingError::Io(_)
		)
	}
}

pub type Result<T> = std::result::Result<T, SignalingError>;
