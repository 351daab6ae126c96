//! Client-facing JSON frames (WebSocket text frames).

use serde::{Deserialize, Serialize};

use crate::error::{ClientCode, Result, RelayError};
use crate::message::Message;

/// Destination for "send chat message".
pub const SEND_MESSAGE: &str = "/app/chat.sendMessage";
/// Destination for "add user".
pub const ADD_USER: &str = "/app/chat.addUser";

/// Inbound frame: a message aimed at one of the relay's endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientFrame {
    pub destination: String,
    pub message: Message,
}

impl ClientFrame {
    pub fn new(destination: impl Into<String>, message: Message) -> Self {
        Self {
            destination: destination.into(),
            message,
        }
    }

    pub fn decode(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| RelayError::Protocol(format!("invalid frame: {e}")))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| RelayError::Internal(format!("frame encode failed: {e}")))
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.destination)
    }
}

/// Inbound endpoints the relay serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    SendMessage,
    AddUser,
}

impl Endpoint {
    pub fn parse(destination: &str) -> Result<Self> {
        match destination {
            SEND_MESSAGE => Ok(Endpoint::SendMessage),
            ADD_USER => Ok(Endpoint::AddUser),
            other => Err(RelayError::Protocol(format!("unknown destination: {other}"))),
        }
    }
}

/// Outbound frame pushed to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum ServerFrame {
    /// A broadcast delivered from a subscribed destination.
    Message { destination: String, message: Message },
    /// Rejection of the recipient's own frame.
    Error { code: String, msg: String },
}

impl ServerFrame {
    pub fn message(destination: impl Into<String>, message: Message) -> Self {
        ServerFrame::Message {
            destination: destination.into(),
            message,
        }
    }

    pub fn error(code: ClientCode, msg: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.as_str().to_string(),
            msg: msg.into(),
        }
    }

    /// Error frame describing `err` for the connection that caused it.
    pub fn from_error(err: &RelayError) -> Self {
        Self::error(err.client_code(), err.to_string())
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| RelayError::Internal(format!("frame encode failed: {e}")))
    }

    pub fn decode(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| RelayError::Protocol(format!("invalid frame: {e}")))
    }
}
