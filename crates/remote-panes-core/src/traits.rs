//! Core traits for transports and their collaborators.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Readiness of a sub-channel, mirroring a data channel's `readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
    /// No sub-channel attached.
    Disconnected,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Connection state of the underlying peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Transport error.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Sub-channel {0} is not open")]
    NotOpen(String),
    #[error("Transport closed")]
    Closed,
    #[error("Identity unavailable: {0}")]
    Identity(String),
    #[error("ICE servers unavailable: {0}")]
    IceServers(String),
    #[error("Not supported: {0}")]
    NotSupported(String),
}

/// Event emitted by a sub-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubChannelEvent {
    Open,
    Message(Bytes),
    Close,
}

/// One duplex byte stream multiplexed over a peer transport.
pub trait SubChannel: Send + Sync {
    /// Label the sub-channel was created with.
    fn label(&self) -> &str;

    /// Current readiness.
    fn ready_state(&self) -> ReadyState;

    /// Send a message. Fails unless the sub-channel is open.
    ///
    /// # Errors
    /// Returns error if the sub-channel is not open.
    fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Close the sub-channel. Idempotent.
    fn close(&self);
}

/// A sub-channel together with its event stream.
pub struct SubChannelLink {
    pub channel: Arc<dyn SubChannel>,
    pub events: mpsc::UnboundedReceiver<SubChannelEvent>,
}

impl fmt::Debug for SubChannelLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubChannelLink")
            .field("label", &self.channel.label())
            .field("ready_state", &self.channel.ready_state())
            .finish_non_exhaustive()
    }
}

/// Event emitted by a peer transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport changed connection state.
    StateChanged(TransportState),
    /// The remote opened a sub-channel.
    SubChannel(SubChannelLink),
}

/// An established (or establishing) duplex connection to one peer.
pub trait PeerTransport: Send + Sync {
    /// Create a locally-initiated sub-channel.
    ///
    /// # Errors
    /// Returns error if the transport is closed.
    fn create_sub_channel(&self, label: &str) -> Result<SubChannelLink, TransportError>;

    /// Current connection state.
    fn state(&self) -> TransportState;

    /// Close the transport and every sub-channel on it. Idempotent.
    fn close(&self);
}

/// A freshly opened transport with its event stream.
pub struct TransportLink {
    pub transport: Arc<dyn PeerTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// STUN/TURN server description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Server without credentials.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Certificate material handed to the transport factory.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    /// DER encoded certificate.
    pub der: Vec<u8>,
    /// DER encoded private key.
    pub private_key: Vec<u8>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("der_len", &self.der.len())
            .finish_non_exhaustive()
    }
}

/// Everything a transport factory needs to open a connection.
#[derive(Debug, Clone, Default)]
pub struct TransportParams {
    pub ice_servers: Vec<IceServer>,
    pub certificate: Option<Certificate>,
    pub fingerprint: Option<String>,
}

/// Local identity used to authenticate the transport.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Fingerprint of the local certificate.
    fn fingerprint(&self) -> String;

    /// Certificate usable by the transport factory.
    async fn certificate(&self) -> Result<Certificate, TransportError>;
}

/// Source of ICE servers.
#[async_trait]
pub trait IceServerSource: Send + Sync {
    /// Fetch the servers to use for the next connection.
    async fn ice_servers(&self) -> Result<Vec<IceServer>, TransportError>;
}

/// A fixed list of ICE servers.
#[async_trait]
impl IceServerSource for Vec<IceServer> {
    async fn ice_servers(&self) -> Result<Vec<IceServer>, TransportError> {
        Ok(self.clone())
    }
}

/// Opens peer transports.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport to the remote peer.
    async fn open(&self, params: TransportParams) -> Result<TransportLink, TransportError>;
}
