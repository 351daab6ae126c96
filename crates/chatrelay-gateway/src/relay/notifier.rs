use std::sync::Arc;

use chatrelay_core::error::Result;
use chatrelay_core::Message;

use super::RelayDispatcher;
use crate::session::ConnectionId;

/// Emits the synthetic LEAVE for a closed connection.
pub struct DisconnectNotifier {
    dispatcher: Arc<RelayDispatcher>,
}

impl DisconnectNotifier {
    pub fn new(dispatcher: Arc<RelayDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Evict the connection's binding and announce its departure.
    ///
    /// Returns the published LEAVE, or `None` when the connection never
    /// joined or was already evicted.
    pub async fn on_disconnect(&self, conn: ConnectionId) -> Result<Option<Message>> {
        let Some(sender) = self.dispatcher.sessions().evict(conn) else {
            tracing::debug!(%conn, "disconnect without session");
            return Ok(None);
        };

        tracing::info!(%conn, %sender, "user left");
        let out = self
            .dispatcher
            .handle_trusted(conn, Message::leave(sender))
            .await?;
        Ok(Some(out))
    }
}
