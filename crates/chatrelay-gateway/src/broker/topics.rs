use dashmap::DashMap;
use tokio::sync::broadcast;

use super::{Delivery, SUBSCRIBER_CAPACITY};

/// Local fanout: destination -> broadcast channel of deliveries.
#[derive(Default)]
pub struct Topics {
    channels: DashMap<String, broadcast::Sender<Delivery>>,
}

impl Topics {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, destination: &str) -> broadcast::Receiver<Delivery> {
        self.channels
            .entry(destination.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CAPACITY).0)
            .subscribe()
    }

    /// Deliver to current local subscribers. Returns how many received it.
    pub fn fanout(&self, destination: &str, msg: Delivery) -> usize {
        let Some(tx) = self.channels.get(destination) else {
            return 0;
        };
        // send() errs only when there are no receivers.
        tx.send(msg).unwrap_or(0)
    }

    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.channels
            .get(destination)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}
