//! chatrelay core: transport-agnostic message model, wire frames, and errors.
//!
//! This crate defines the chat message shape, the JSON frames exchanged with
//! WebSocket clients, and the STOMP codec spoken to the external broker. It
//! carries no transport or runtime dependencies so the gateway and tests can
//! share it freely.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here.
//! All fallible paths surface as `RelayError`/`Result` so a malformed client
//! frame or broker frame never takes the process down.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod message;
pub mod protocol;

/// Shared result type.
pub use error::{Result, RelayError};
pub use message::{Message, MessageKind};
