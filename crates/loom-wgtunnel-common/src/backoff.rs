// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;

/// Exponential backoff with up to 20% random jitter added to each delay.
#[derive(Debug, Clone)]
pub struct Backoff {
	initial: Duration,
	max: Duration,
	current: Duration,
}

impl Backoff {
	pub fn new(initial: Duration, max: Duration) -> Self {
		Self {
			initial,
			max,
			current: initial,
		}
	}

	/// Returns the next delay and doubles the base for the following call.
	pub fn next_delay(&mut self) -> Duration {
		let base = self.current;
		self.current = (self.current * 2).min(self.max);
		base + jitter(base)
	}

	pub fn reset(&mut self) {
		self.current = self.initial;
	}

	pub fn current(&self) -> Duration {
		self.current
	}
}

impl Default for Backoff {
	fn default() -> Self {
		Self::new(Duration::from_secs(1), Duration::from_secs(60))
	}
}

fn jitter(base: Duration) -> Duration {
	let max_ms = (base.as_millis() / 5) as u64;
	if max_ms == 0 {
		return Duration::ZERO;
	}
	Duration::from_millis(fastrand::u64(0..=max_ms))
}
