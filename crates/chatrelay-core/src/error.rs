//! Shared error type across chatrelay crates.

use thiserror::Error;

/// Client-facing error codes (stable API).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCode {
    /// Malformed frame, unknown kind or destination, missing sender.
    ProtocolError,
    /// The broker cannot accept publishes right now.
    BrokerUnavailable,
    /// Invalid configuration.
    BadConfig,
    /// Unsupported config schema version.
    UnsupportedVersion,
    /// Internal server error.
    Internal,
}

impl ClientCode {
    /// String representation used in JSON responses.
    pub fn as_str(self) -> &'static str {
        match self {
            ClientCode::ProtocolError => "PROTOCOL_ERROR",
            ClientCode::BrokerUnavailable => "BROKER_UNAVAILABLE",
            ClientCode::BadConfig => "BAD_CONFIG",
            ClientCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ClientCode::Internal => "INTERNAL",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Unified error type used by core and gateway.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("bad config: {0}")]
    Config(String),
    #[error("unsupported config version")]
    UnsupportedVersion,
    #[error("internal: {0}")]
    Internal(String),
}

impl RelayError {
    /// Map internal error to a stable client-facing code.
    pub fn client_code(&self) -> ClientCode {
        match self {
            RelayError::Protocol(_) => ClientCode::ProtocolError,
            RelayError::BrokerUnavailable(_) => ClientCode::BrokerUnavailable,
            RelayError::Config(_) => ClientCode::BadConfig,
            RelayError::UnsupportedVersion => ClientCode::UnsupportedVersion,
            RelayError::Internal(_) => ClientCode::Internal,
        }
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, RelayError::Protocol(_))
    }

    pub fn is_broker_unavailable(&self) -> bool {
        matches!(self, RelayError::BrokerUnavailable(_))
    }
}
