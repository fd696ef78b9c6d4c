//! Wire protocol for the control sub-channel.
//!
//! Requests are JSON objects `{type, args, message_id, time}`; replies are
//! `{type: "ack" | "nack", args: {ref, body}}`. Sub-channels opened by the
//! remote for a pane carry the label `"<message_id>:<channel_id>"`.

use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Control message identifier, unique per session.
pub type MessageId = u64;

/// Remote-assigned pane channel identifier.
pub type ChannelId = u64;

/// Opaque restore point issued by the remote.
pub type Marker = i64;

/// Protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Control frame is not a JSON object")]
    NotAnObject,
    #[error("Control frame is missing {0}")]
    MissingField(&'static str),
    #[error("Invalid channel label {label:?}: {reason}")]
    InvalidLabel { label: String, reason: String },
}

/// Commands the client sends over the control sub-channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "args", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Authenticate this client.
    Auth {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fingerprint: Option<String>,
    },
    /// Spawn a new remote process and open a pane channel for it.
    AddPane {
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ChannelId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    /// Open a new pane channel for an existing remote process.
    ReconnectPane {
        id: ChannelId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    /// Resize a remote pane.
    Resize { id: ChannelId, cols: u16, rows: u16 },
    /// Fetch the serialized layout.
    GetPayload,
    /// Store the serialized layout.
    SetPayload { payload: String },
    /// Ask for a restore point.
    Mark,
    /// Resume from a restore point.
    Restore { marker: Marker },
}

impl ControlCommand {
    /// Wire name of the command.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::AddPane { .. } => "add_pane",
            Self::ReconnectPane { .. } => "reconnect_pane",
            Self::Resize { .. } => "resize",
            Self::GetPayload => "get_payload",
            Self::SetPayload { .. } => "set_payload",
            Self::Mark => "mark",
            Self::Restore { .. } => "restore",
        }
    }
}

/// A command stamped with its id and first-send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: MessageId,
    /// Milliseconds since the Unix epoch at first send.
    pub time: i64,
    pub command: ControlCommand,
}

impl Envelope {
    /// Stamp a command with the current time.
    #[must_use]
    pub fn new(message_id: MessageId, command: ControlCommand) -> Self {
        Self {
            message_id,
            time: now_millis(),
            command,
        }
    }

    /// Serialize to the wire form.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let Value::Object(mut map) = serde_json::to_value(&self.command)? else {
            return Err(ProtocolError::NotAnObject);
        };
        map.insert("message_id".to_string(), Value::from(self.message_id));
        map.insert("time".to_string(), Value::from(self.time));
        Ok(Bytes::from(serde_json::to_vec(&map)?))
    }

    /// Parse the wire form.
    ///
    /// # Errors
    /// Returns error if the frame is malformed.
    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        let mut map: Map<String, Value> = serde_json::from_slice(raw)?;
        let message_id = map
            .remove("message_id")
            .and_then(|v| v.as_u64())
            .ok_or(ProtocolError::MissingField("message_id"))?;
        let time = map.remove("time").and_then(|v| v.as_i64()).unwrap_or(0);
        map.remove("tries");
        let command = serde_json::from_value(Value::Object(map))?;
        Ok(Self {
            message_id,
            time,
            command,
        })
    }
}

/// Body of an ack or nack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Id of the message being answered.
    #[serde(rename = "ref")]
    pub reference: MessageId,
    #[serde(default)]
    pub body: Value,
}

/// Reply sent by the remote for every control message it processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "args", rename_all = "snake_case")]
pub enum ReplyFrame {
    Ack(Reply),
    Nack(Reply),
}

impl ReplyFrame {
    /// Acknowledge `reference` with `body`.
    #[must_use]
    pub fn ack(reference: MessageId, body: impl Into<Value>) -> Self {
        Self::Ack(Reply {
            reference,
            body: body.into(),
        })
    }

    /// Refuse `reference` with `body`.
    #[must_use]
    pub fn nack(reference: MessageId, body: impl Into<Value>) -> Self {
        Self::Nack(Reply {
            reference,
            body: body.into(),
        })
    }

    /// Id of the message being answered.
    #[must_use]
    pub const fn reference(&self) -> MessageId {
        match self {
            Self::Ack(reply) | Self::Nack(reply) => reply.reference,
        }
    }

    /// Serialize to the wire form.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse the wire form.
    ///
    /// # Errors
    /// Returns error if the frame is not an ack or nack.
    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Label of a pane sub-channel opened by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelLabel {
    /// Control message that requested the channel.
    pub message_id: MessageId,
    /// Channel id assigned by the remote.
    pub channel_id: ChannelId,
}

impl ChannelLabel {
    pub const DELIMITER: char = ':';

    #[must_use]
    pub const fn new(message_id: MessageId, channel_id: ChannelId) -> Self {
        Self {
            message_id,
            channel_id,
        }
    }
}

impl fmt::Display for ChannelLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.message_id, Self::DELIMITER, self.channel_id)
    }
}

impl FromStr for ChannelLabel {
    type Err = ProtocolError;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ProtocolError::InvalidLabel {
            label: label.to_string(),
            reason,
        };
        let (message_id, channel_id) = label
            .split_once(Self::DELIMITER)
            .ok_or_else(|| invalid(format!("missing '{}'", Self::DELIMITER)))?;
        let message_id = message_id
            .trim()
            .parse()
            .map_err(|e| invalid(format!("message id: {e}")))?;
        let channel_id = channel_id
            .trim()
            .parse()
            .map_err(|e| invalid(format!("channel id: {e}")))?;
        Ok(Self {
            message_id,
            channel_id,
        })
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
