//! Broker bridge: the relay's only path to subscribers.
//!
//! The relay never fans out on its own when a broker is configured; every
//! accepted message is published to the broker and comes back through a
//! subscription. The bridge owns the broker connection, its credentials, and
//! its lifecycle:
//!
//! `Disconnected -> Connecting -> Connected -> Degraded -> Connecting ...`
//!
//! Two bridges are provided:
//! - [`StompBroker`]: STOMP 1.2 over TCP (RabbitMQ, ActiveMQ, ...).
//! - [`LocalBroker`]: in-process fanout for single-instance runs and tests.

pub mod backoff;
mod local;
mod stomp;
mod topics;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use chatrelay_core::error::Result;
use chatrelay_core::Message;

pub use local::LocalBroker;
pub use stomp::StompBroker;
pub use topics::Topics;

/// One message delivered from a subscribed destination.
pub type Delivery = Arc<Message>;

/// Per-destination buffer for local subscribers. Slow receivers lag and skip.
pub const SUBSCRIBER_CAPACITY: usize = 1024;

/// Broker connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Disconnected,
    Connecting,
    Connected,
    /// Transport failure observed; reconnect scheduled with backoff.
    Degraded,
}

impl BrokerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BrokerState::Disconnected => "disconnected",
            BrokerState::Connecting => "connecting",
            BrokerState::Connected => "connected",
            BrokerState::Degraded => "degraded",
        }
    }

    pub fn is_ready(self) -> bool {
        self == BrokerState::Connected
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publish/subscribe against a message broker.
///
/// Implementations serialize concurrent publishes internally; callers share
/// one instance as `Arc<dyn BrokerBridge>`.
#[async_trait]
pub trait BrokerBridge: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Hand `message` to the broker for `destination`.
    ///
    /// Resolves once the broker accepted the frame, not once subscribers got
    /// it. Fails with `BrokerUnavailable` when the bridge is not connected or
    /// the broker does not answer in time. Failed publishes are never retried
    /// by the bridge.
    async fn publish(&self, destination: &str, message: &Message) -> Result<()>;

    /// Receive everything published to `destination` from now on.
    async fn subscribe(&self, destination: &str) -> Result<broadcast::Receiver<Delivery>>;

    fn state(&self) -> BrokerState;

    fn state_watch(&self) -> watch::Receiver<BrokerState>;

    /// Release the broker connection. Further publishes fail.
    async fn shutdown(&self);
}

/// Build the bridge selected by `broker.mode` and start its connection.
pub async fn from_config(cfg: &crate::config::BrokerConfig) -> Arc<dyn BrokerBridge> {
    match cfg.mode {
        crate::config::BrokerMode::Stomp => Arc::new(StompBroker::start(cfg.clone()).await),
        crate::config::BrokerMode::Local => Arc::new(LocalBroker::new()),
    }
}
