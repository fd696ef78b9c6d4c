//! Core abstractions for multiplexed remote pane sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionConfig` - Network tuning and authentication settings
//! - `SessionState` / `FailureReason` - Observable session lifecycle
//! - Transport, sub-channel, identity and ICE collaborator traits

pub mod config;
pub mod state;
pub mod traits;

pub use config::{ConfigError, NetConfig, SessionConfig};
pub use state::{FailureReason, SessionState, StateChange};
pub use traits::{
    Certificate, IceServer, IceServerSource, IdentityProvider, PeerTransport, ReadyState,
    SubChannel, SubChannelEvent, SubChannelLink, TransportError, TransportEvent, TransportFactory,
    TransportLink, TransportParams, TransportState,
};
