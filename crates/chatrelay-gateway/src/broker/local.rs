use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use chatrelay_core::error::{Result, RelayError};
use chatrelay_core::Message;

use super::{BrokerBridge, BrokerState, Delivery, Topics};

/// In-process broker: publishes fan out directly to local subscribers.
///
/// Connected from construction until `shutdown`. `set_state` forces a
/// lifecycle state so outages can be simulated.
pub struct LocalBroker {
    topics: Topics,
    state: watch::Sender<BrokerState>,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(BrokerState::Connected);
        Self {
            topics: Topics::new(),
            state,
        }
    }

    pub fn set_state(&self, next: BrokerState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::info!(from = %prev, to = %next, "local broker state changed");
        }
    }

    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.topics.subscriber_count(destination)
    }
}

#[async_trait]
impl BrokerBridge for LocalBroker {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn publish(&self, destination: &str, message: &Message) -> Result<()> {
        let state = *self.state.borrow();
        if state != BrokerState::Connected {
            return Err(RelayError::BrokerUnavailable(format!("broker {state}")));
        }
        let n = self.topics.fanout(destination, Arc::new(message.clone()));
        tracing::trace!(destination, receivers = n, "local publish");
        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<broadcast::Receiver<Delivery>> {
        Ok(self.topics.subscribe(destination))
    }

    fn state(&self) -> BrokerState {
        *self.state.borrow()
    }

    fn state_watch(&self) -> watch::Receiver<BrokerState> {
        self.state.subscribe()
    }

    async fn shutdown(&self) {
        self.set_state(BrokerState::Disconnected);
    }
}
