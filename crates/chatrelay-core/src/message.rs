//! Chat message model.
//!
//! The wire form is a flat JSON object:
//! `{"type": "CHAT" | "JOIN" | "LEAVE", "sender": "...", "content": "..."}`.
//! The kind set is closed; an unknown `type` is a protocol error, never a
//! silent default.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RelayError};

/// Message kind. Drives the relay's per-kind processing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Chat,
    Join,
    Leave,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Chat => "CHAT",
            MessageKind::Join => "JOIN",
            MessageKind::Leave => "LEAVE",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CHAT" => Ok(MessageKind::Chat),
            "JOIN" => Ok(MessageKind::Join),
            "LEAVE" => Ok(MessageKind::Leave),
            other => Err(RelayError::Protocol(format!("unknown message kind: {other}"))),
        }
    }
}

/// One chat message as it travels between clients, relay, and broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    /// Field name is `type` on the wire.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Display name. Validated by the relay, so the decoder tolerates absence.
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub content: String,
}

impl Message {
    pub fn new(kind: MessageKind, sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind,
            sender: sender.into(),
            content: content.into(),
        }
    }

    pub fn chat(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MessageKind::Chat, sender, content)
    }

    /// JOIN with the canned notice already in place.
    pub fn join(sender: impl Into<String>) -> Self {
        let sender = sender.into();
        let content = join_notice(&sender);
        Self::new(MessageKind::Join, sender, content)
    }

    /// LEAVE with the canned notice already in place.
    pub fn leave(sender: impl Into<String>) -> Self {
        let sender = sender.into();
        let content = leave_notice(&sender);
        Self::new(MessageKind::Leave, sender, content)
    }

    /// Reject messages without a usable sender.
    pub fn validate_sender(&self) -> Result<()> {
        if self.sender.trim().is_empty() {
            return Err(RelayError::Protocol(format!(
                "{} requires a non-empty sender",
                self.kind
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| RelayError::Internal(format!("message encode failed: {e}")))
    }

    pub fn decode(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| RelayError::Protocol(format!("invalid message: {e}")))
    }

    pub fn decode_slice(b: &[u8]) -> Result<Self> {
        serde_json::from_slice(b).map_err(|e| RelayError::Protocol(format!("invalid message: {e}")))
    }
}

pub fn join_notice(sender: &str) -> String {
    format!("{sender} joined the chat")
}

pub fn leave_notice(sender: &str) -> String {
    format!("{sender} left the chat")
}
