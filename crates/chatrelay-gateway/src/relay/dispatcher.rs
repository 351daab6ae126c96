use std::sync::Arc;

use chatrelay_core::error::{Result, RelayError};
use chatrelay_core::message::{join_notice, leave_notice};
use chatrelay_core::protocol::frame::{ClientFrame, Endpoint};
use chatrelay_core::{Message, MessageKind};

use crate::broker::BrokerBridge;
use crate::obs::RelayMetrics;
use crate::session::{ConnectionId, SessionRegistry};

/// Where a message came from. Server-generated messages skip client rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Client,
    Server,
}

/// Applies per-kind rules and publishes the result to the broadcast destination.
///
/// Validation runs before any registry mutation, and mutation before publish:
/// a rejected frame leaves no trace.
pub struct RelayDispatcher {
    sessions: Arc<SessionRegistry>,
    broker: Arc<dyn BrokerBridge>,
    destination: Arc<str>,
    metrics: Arc<RelayMetrics>,
}

impl RelayDispatcher {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        broker: Arc<dyn BrokerBridge>,
        destination: impl Into<Arc<str>>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            sessions,
            broker,
            destination: destination.into(),
            metrics,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn broker(&self) -> &Arc<dyn BrokerBridge> {
        &self.broker
    }

    /// Route a client frame by its endpoint.
    ///
    /// "add user" is always a JOIN regardless of the kind the client put in
    /// the message; "send chat message" keeps the supplied kind.
    pub async fn route(&self, conn: ConnectionId, frame: ClientFrame) -> Result<Message> {
        let endpoint = match frame.endpoint() {
            Ok(ep) => ep,
            Err(e) => {
                self.reject(conn, &e);
                return Err(e);
            }
        };
        let mut msg = frame.message;
        if endpoint == Endpoint::AddUser {
            msg.kind = MessageKind::Join;
        }
        self.handle(conn, msg).await
    }

    /// Handle a client-submitted message and return what was published.
    pub async fn handle(&self, conn: ConnectionId, inbound: Message) -> Result<Message> {
        self.dispatch(conn, inbound, Origin::Client).await
    }

    /// Handle a server-generated message (synthetic LEAVE).
    pub async fn handle_trusted(&self, conn: ConnectionId, msg: Message) -> Result<Message> {
        self.dispatch(conn, msg, Origin::Server).await
    }

    async fn dispatch(&self, conn: ConnectionId, inbound: Message, origin: Origin) -> Result<Message> {
        let out = match self.transform(conn, inbound, origin) {
            Ok(out) => out,
            Err(e) => {
                self.reject(conn, &e);
                return Err(e);
            }
        };

        if let Err(e) = self.broker.publish(&self.destination, &out).await {
            tracing::warn!(%conn, kind = %out.kind, broker = self.broker.name(), error = %e, "publish failed");
            self.metrics.broker_publish_failures.inc(&[("kind", out.kind.as_str())]);
            self.metrics.frames_rejected.inc(&[("reason", "broker")]);
            return Err(e);
        }

        self.metrics.frames_relayed.inc(&[("kind", out.kind.as_str())]);
        tracing::debug!(%conn, kind = %out.kind, sender = %out.sender, "relayed");
        Ok(out)
    }

    fn transform(&self, conn: ConnectionId, mut msg: Message, origin: Origin) -> Result<Message> {
        msg.validate_sender()?;

        match msg.kind {
            MessageKind::Chat => {}
            MessageKind::Join => {
                self.sessions.bind(conn, msg.sender.clone());
                msg.content = join_notice(&msg.sender);
                tracing::info!(%conn, sender = %msg.sender, "user joined");
            }
            MessageKind::Leave => {
                if origin == Origin::Client {
                    return Err(RelayError::Protocol(
                        "LEAVE is server-generated and cannot be sent by clients".into(),
                    ));
                }
                msg.content = leave_notice(&msg.sender);
            }
        }
        Ok(msg)
    }

    fn reject(&self, conn: ConnectionId, err: &RelayError) {
        tracing::debug!(%conn, error = %err, "frame rejected");
        self.metrics.frames_rejected.inc(&[("reason", "protocol")]);
    }
}
