//! Observable session lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, never connected.
    New,
    /// A connect or reconnect attempt is in progress.
    Connecting,
    /// Control transport open, authenticated and restored.
    Connected,
    /// Transport dropped or session disengaged; may reconnect.
    Disconnected,
    /// Unrecoverable failure of the last attempt.
    Failed,
    /// Closed by the owner. Terminal.
    Closed,
}

impl SessionState {
    /// Whether `reconnect` is meaningful from this state.
    #[must_use]
    pub const fn can_reconnect(self) -> bool {
        matches!(self, Self::New | Self::Disconnected | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session or operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Control message or channel open exceeded its time budget.
    Timeout,
    /// Remote rejected authentication.
    Unauthorized,
    /// Remote returned or rejected an unusable marker.
    BadMarker,
    /// Transport negotiation failed.
    BadRemoteDescription,
    /// An open sub-channel closed unexpectedly.
    DataChannelLost,
    /// Remote or transport combination unusable.
    NotSupported,
    /// Caller-initiated cancellation.
    Cancelled,
    /// Protocol desync between local and remote.
    InternalError,
    /// Underlying transport disconnected or failed.
    TransportLost,
    /// ICE servers or identity could not be obtained.
    Prerequisite,
    /// Remote refused a command.
    Rejected,
    /// Operation needs an open control transport.
    NotConnected,
    /// Operation not valid in the current state.
    InvalidState,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Unauthorized => "unauthorized",
            Self::BadMarker => "bad marker",
            Self::BadRemoteDescription => "bad remote description",
            Self::DataChannelLost => "data channel lost",
            Self::NotSupported => "not supported",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internal error",
            Self::TransportLost => "transport lost",
            Self::Prerequisite => "prerequisite unavailable",
            Self::Rejected => "rejected",
            Self::NotConnected => "not connected",
            Self::InvalidState => "invalid state",
        };
        f.write_str(name)
    }
}

/// A state transition as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: SessionState,
    pub reason: Option<FailureReason>,
}

impl StateChange {
    #[must_use]
    pub const fn new(state: SessionState, reason: Option<FailureReason>) -> Self {
        Self { state, reason }
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            Some(reason) => write!(f, "{} ({reason})", self.state),
            None => write!(f, "{}", self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnectable_states() {
        assert!(SessionState::Disconnected.can_reconnect());
        assert!(SessionState::Failed.can_reconnect());
        assert!(!SessionState::Connecting.can_reconnect());
        assert!(!SessionState::Closed.can_reconnect());
    }

    #[test]
    fn test_state_change_display() {
        let change = StateChange::new(SessionState::Failed, Some(FailureReason::Timeout));
        assert_eq!(change.to_string(), "failed (timeout)");
        let change = StateChange::new(SessionState::Connected, None);
        assert_eq!(change.to_string(), "connected");
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_string(&FailureReason::DataChannelLost).unwrap();
        assert_eq!(json, "\"data_channel_lost\"");
    }
}
