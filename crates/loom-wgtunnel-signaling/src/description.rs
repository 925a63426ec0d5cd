// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::candidate::Candidate;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

const UFRAG_LEN: usize = 16;
const PWD_LEN: usize = 32;

/// ICE username fragment and password for one agent lifetime.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
	pub ufrag: String,
	pub pwd: String,
}

impl Credentials {
	pub fn new(ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
		Self {
			ufrag: ufrag.into(),
			pwd: pwd.into(),
		}
	}

	pub fn generate() -> Self {
		Self {
			ufrag: random_string(UFRAG_LEN),
			pwd: random_string(PWD_LEN),
		}
	}
}

fn random_string(len: usize) -> String {
	rand::thread_rng()
		.sample_iter(&Alphanumeric)
		.take(len)
		.map(char::from)
		.collect()
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("ufrag", &self.ufrag)
			.field("pwd", &"[REDACTED]")
			.finish()
	}
}

/// What one peer tells the other about its current ICE agent.
///
/// Receivers discard descriptions whose `epoch` is not greater than the last
/// epoch they accepted from the same sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
	pub epoch: u64,
	pub credentials: Credentials,
	#[serde(default)]
	pub candidates: Vec<Candidate>,
	/// The sender has not seen our description for this round yet.
	#[serde(default)]
	pub need_reply: bool,
	/// The sender is tearing its session down. Carries no candidates.
	#[serde(default)]
	pub closing: bool,
}

impl SessionDescription {
	pub fn new(epoch: u64, credentials: Credentials, candidates: Vec<Candidate>) -> Self {
		Self {
			epoch,
			credentials,
			candidates,
			need_reply: false,
			closing: false,
		}
	}

	/// Last description a session sends before it goes away.
	pub fn closing(epoch: u64, credentials: Credentials) -> Self {
		Self {
			closing: true,
			..Self::new(epoch, credentials, Vec::new())
		}
	}

	pub fn with_need_reply(mut self, need_reply: bool) -> Self {
		self.need_reply = need_reply;
		self
	}

	/// True if `self` supersedes a description with epoch `last`.
	pub fn is_newer_than(&self, last: Option<u64>) -> bool {
		match last {
			Some(last) => self.epoch > last,
			None => true,
		}
	}
}
