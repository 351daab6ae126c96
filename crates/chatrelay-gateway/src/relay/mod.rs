//! Session-scoped message relay.
//!
//! `RelayDispatcher` classifies and rewrites inbound messages, then publishes
//! them to the broadcast destination. `DisconnectNotifier` turns a closed
//! connection into a synthetic LEAVE through the same dispatcher.

pub mod dispatcher;
pub mod notifier;

pub use dispatcher::RelayDispatcher;
pub use notifier::DisconnectNotifier;
