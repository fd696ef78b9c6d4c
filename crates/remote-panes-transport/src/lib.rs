//! Wire protocol and transports for remote pane sessions.
//!
//! Provides:
//! - Control protocol (JSON envelopes, ack/nack replies, pane channel labels)
//! - In-memory peer transport (feature: memory)
//! - Loopback host that serves the control protocol (feature: memory)

pub mod protocol;

#[cfg(feature = "memory")]
pub mod loopback;

#[cfg(feature = "memory")]
pub mod memory;

pub use protocol::{
    ChannelId, ChannelLabel, ControlCommand, Envelope, Marker, MessageId, ProtocolError, Reply,
    ReplyFrame,
};

#[cfg(feature = "memory")]
pub use loopback::{HostOptions, LoopbackHost};
#[cfg(feature = "memory")]
pub use memory::{MemoryRemote, MemoryTransport, MemoryTransportFactory, RemoteChannel, RemoteHandle};
