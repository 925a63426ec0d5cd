// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Signaling for WireGuard endpoint discovery.
//!
//! Peers exchange [`SessionDescription`]s sealed into [`Envelope`]s with
//! their WireGuard keys. A [`Backend`] moves envelopes over some transport;
//! backends are created from URLs through a [`BackendRegistry`] and combined
//! with [`MultiBackend`].

pub mod backend;
pub mod backends;
pub mod candidate;
pub mod codec;
pub mod description;
pub mod error;
pub mod multi;
pub mod registry;
pub mod subscriptions;

pub use backend::{
	Backend, BackendConfig, BackendType, ChannelHandler, Inbound, MessageHandler, ReadyHandler,
};
pub use backends::inprocess::{InProcessBackend, InProcessHub};
pub use backends::manual::ManualBackend;
pub use candidate::{Candidate, CandidateKind, CandidateParseError, NetworkType, RelatedAddress, TcpType};
pub use codec::{Envelope, NONCE_LEN};
pub use description::{Credentials, SessionDescription};
pub use error::{CodecError, Result, SignalingError};
pub use multi::MultiBackend;
pub use registry::{split_scheme, BackendFactory, BackendRegistry};
pub use subscriptions::{Dispatch, SubscriptionRegistry};
