//! The JSON wire protocol between clients and rooms.
//!
//! Every frame is one JSON object discriminated by its `type` member.
//! Unknown or malformed frames are dropped by the receiving side, so both
//! decode paths surface a [`MessageError`] instead of panicking.

use serde::{Deserialize, Serialize};

use crate::patch::Patch;

/// Protocol revision shared by both sides. A mismatch during reconnect
/// produces a `version-mismatch` response and dooms the client session.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message frame: {0}")]
    Malformed(String),
    #[error("message could not be encoded: {0}")]
    Encode(String),
}

/// Frames sent from a client to its room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Patch {
        message_id: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        document_patches: Vec<Patch>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ephemeral_patches: Vec<Patch>,
    },
    #[serde(rename_all = "camelCase")]
    Reconnect {
        last_timestamp: u64,
        protocol_version: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        document_patches: Vec<Patch>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ephemeral_patches: Vec<Patch>,
    },
}

/// Frames sent from a room to its clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Ack { message_id: String, timestamp: u64 },
    #[serde(rename_all = "camelCase")]
    Patch {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        document_patches: Vec<Patch>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ephemeral_patches: Vec<Patch>,
        /// Empty when the patch originates from the room itself, e.g. a
        /// reconnect diff.
        client_id: String,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    ClientCount { count: usize },
    #[serde(rename = "version-mismatch", rename_all = "camelCase")]
    VersionMismatch { server_protocol_version: u32 },
}

impl ClientMessage {
    pub fn decode(frame: &str) -> Result<Self, MessageError> {
        serde_json::from_str(frame).map_err(|err| MessageError::Malformed(err.to_string()))
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|err| MessageError::Encode(err.to_string()))
    }
}

impl ServerMessage {
    pub fn decode(frame: &str) -> Result<Self, MessageError> {
        serde_json::from_str(frame).map_err(|err| MessageError::Malformed(err.to_string()))
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|err| MessageError::Encode(err.to_string()))
    }
}
