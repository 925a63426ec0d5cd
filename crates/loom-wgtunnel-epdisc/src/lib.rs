// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! ICE-driven endpoint discovery for WireGuard peers.
//!
//! An [`EndpointDiscovery`] runs one session per remote peer of an
//! interface. Sessions exchange session descriptions over a signaling
//! [`Backend`](loom_wgtunnel_signaling::Backend), drive an ICE agent to a
//! nominated candidate pair, and write the resulting address into the
//! WireGuard device as the peer's endpoint.

pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod ice;
pub mod session;
pub mod settings;
pub mod status;
pub mod wg;

pub use device::{Device, DevicePeer, DeviceUpdate, MemoryDevice, PeerUpdate, WireGuardDevice};
pub use discovery::EndpointDiscovery;
pub use error::{DeviceError, EpdiscError, IceError, Result};
pub use events::{Event, EventBus, EventSubscription};
pub use ice::mock::{MockAgent, MockAgentFactory};
pub use ice::{
	AgentConfig, AgentEvent, AgentState, IceAgent, IceAgentFactory, Role, WebrtcAgentFactory,
};
pub use session::{SessionContext, SessionControl, SessionHandle};
pub use settings::{IceServer, IceSettings};
pub use status::{ConnectionState, PeerStatus, Reachability};
pub use wg::WgCommandDevice;
