//! Session error type.

use remote_panes_core::{FailureReason, SessionState, TransportError};
use serde_json::Value;
use thiserror::Error;

/// Error returned by session, channel and gate operations.
///
/// Cloneable so one failure can be handed to every waiter it affects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Timed out")]
    Timeout,
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Bad marker: {0}")]
    BadMarker(String),
    #[error("Bad remote description: {0}")]
    BadRemoteDescription(String),
    #[error("Data channel lost")]
    DataChannelLost,
    #[error("Not supported: {0}")]
    NotSupported(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Remote rejected {command}: {body}")]
    Rejected { command: &'static str, body: Value },
    #[error("Not connected")]
    NotConnected,
    #[error("Invalid in state {0}")]
    InvalidState(SessionState),
    #[error("Transport lost")]
    TransportLost,
    #[error("Prerequisite unavailable: {0}")]
    Prerequisite(String),
}

impl SessionError {
    /// Reason reported on the state-change stream.
    #[must_use]
    pub const fn reason(&self) -> FailureReason {
        match self {
            Self::Timeout => FailureReason::Timeout,
            Self::Unauthorized(_) => FailureReason::Unauthorized,
            Self::BadMarker(_) => FailureReason::BadMarker,
            Self::BadRemoteDescription(_) => FailureReason::BadRemoteDescription,
            Self::DataChannelLost => FailureReason::DataChannelLost,
            Self::NotSupported(_) => FailureReason::NotSupported,
            Self::Cancelled => FailureReason::Cancelled,
            Self::Internal(_) => FailureReason::InternalError,
            Self::Rejected { .. } => FailureReason::Rejected,
            Self::NotConnected => FailureReason::NotConnected,
            Self::InvalidState(_) => FailureReason::InvalidState,
            Self::TransportLost => FailureReason::TransportLost,
            Self::Prerequisite(_) => FailureReason::Prerequisite,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::NotOpen(_) => Self::NotConnected,
            TransportError::Closed => Self::DataChannelLost,
            TransportError::Negotiation(e) => Self::BadRemoteDescription(e),
            TransportError::Identity(e) | TransportError::IceServers(e) => Self::Prerequisite(e),
            TransportError::NotSupported(e) => Self::NotSupported(e),
        }
    }
}
