//! chatrelay gateway library entry.
//!
//! Wires the WebSocket transport, session registry, relay dispatcher,
//! disconnect notifier, and broker bridge into one service. Consumed by the
//! binary (`main.rs`) and by integration tests.

pub mod app_state;
pub mod broker;
pub mod config;
pub mod obs;
pub mod ops;
pub mod relay;
pub mod router;
pub mod session;
pub mod transport;
