//! Transport layer (WebSocket).
//!
//! Exposes the WS upgrade handler and the codec that turns socket messages
//! into client frames before they reach the relay.

pub mod codec;
pub mod ws;
