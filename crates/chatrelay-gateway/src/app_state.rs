//! Shared application state for the relay.
//!
//! Wires the session registry, dispatcher, notifier and broker bridge once at
//! startup; handlers clone the cheap `Arc` handle.

use std::sync::Arc;

use crate::broker::BrokerBridge;
use crate::config::RelayConfig;
use crate::obs::RelayMetrics;
use crate::relay::{DisconnectNotifier, RelayDispatcher};
use crate::session::{ConnectionIds, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    cfg: RelayConfig,
    broker: Arc<dyn BrokerBridge>,
    sessions: Arc<SessionRegistry>,
    dispatcher: Arc<RelayDispatcher>,
    notifier: Arc<DisconnectNotifier>,
    connection_ids: ConnectionIds,
    metrics: Arc<RelayMetrics>,
}

impl AppState {
    /// Build application state around an already-started broker bridge.
    pub fn new(cfg: RelayConfig, broker: Arc<dyn BrokerBridge>) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        let metrics = Arc::new(RelayMetrics::default());
        let dispatcher = Arc::new(RelayDispatcher::new(
            Arc::clone(&sessions),
            Arc::clone(&broker),
            cfg.relay.broadcast_destination.clone(),
            Arc::clone(&metrics),
        ));
        let notifier = Arc::new(DisconnectNotifier::new(Arc::clone(&dispatcher)));

        tracing::info!(
            broker = broker.name(),
            destination = %cfg.relay.broadcast_destination,
            "relay state ready"
        );

        Self {
            inner: Arc::new(AppStateInner {
                cfg,
                broker,
                sessions,
                dispatcher,
                notifier,
                connection_ids: ConnectionIds::new(),
                metrics,
            }),
        }
    }

    pub fn cfg(&self) -> &RelayConfig {
        &self.inner.cfg
    }

    pub fn broker(&self) -> Arc<dyn BrokerBridge> {
        Arc::clone(&self.inner.broker)
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.inner.sessions)
    }

    pub fn dispatcher(&self) -> Arc<RelayDispatcher> {
        Arc::clone(&self.inner.dispatcher)
    }

    pub fn notifier(&self) -> Arc<DisconnectNotifier> {
        Arc::clone(&self.inner.notifier)
    }

    pub fn connection_ids(&self) -> &ConnectionIds {
        &self.inner.connection_ids
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.inner.metrics
    }

    /// Readiness follows the broker: the relay is useless without it.
    pub fn is_ready(&self) -> bool {
        self.inner.broker.state().is_ready()
    }

    /// Point-in-time gauges rendered alongside the registered metrics.
    pub fn metrics_extra(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("chatrelay_broker_connected", u64::from(self.is_ready())),
            ("chatrelay_sessions_bound", self.inner.sessions.len() as u64),
        ]
    }
}
