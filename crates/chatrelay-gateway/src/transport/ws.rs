//! WebSocket handler.
//!
//! Responsibilities:
//! - Upgrade HTTP -> WS and allocate a connection id
//! - Subscribe the connection to the broadcast destination
//! - Decode client frames and hand them to the relay, one at a time
//! - Lifecycle: ping + idle timeout
//! - On close, run the disconnect notifier

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, State},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Duration, Instant};
use tracing::Instrument;

use chatrelay_core::error::{Result, RelayError};
use chatrelay_core::protocol::frame::ServerFrame;

use crate::app_state::AppState;
use crate::session::ConnectionId;
use crate::transport::codec::{decode, Inbound};

const IDLE_CHECK_EVERY: Duration = Duration::from_millis(250);

pub async fn ws_upgrade(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let conn = app.connection_ids().next();
        let span = tracing::info_span!("ws", %conn);
        async move {
            if let Err(e) = run_session(&app, conn, socket).await {
                tracing::debug!(error = %e, "session ended with error");
            }
            // The LEAVE goes out even when the session loop failed.
            if let Err(e) = app.notifier().on_disconnect(conn).await {
                tracing::warn!(error = %e, "leave notification failed");
            }
        }
        .instrument(span)
        .await
    })
}

fn error_text(err: &RelayError) -> Option<String> {
    ServerFrame::from_error(err).encode().ok()
}

async fn run_session(app: &AppState, conn: ConnectionId, socket: WebSocket) -> Result<()> {
    let dispatcher = app.dispatcher();
    let destination = dispatcher.destination().to_string();
    let mut deliveries = app.broker().subscribe(&destination).await?;

    let (mut ws_tx, mut ws_rx) = socket.split();

    let gw = &app.cfg().gateway;
    let max_frame_bytes = gw.max_frame_bytes;
    let idle_timeout = Duration::from_millis(gw.idle_timeout_ms);

    let mut ping_tick = tokio::time::interval(Duration::from_millis(gw.ping_interval_ms));
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut idle_tick = tokio::time::interval(IDLE_CHECK_EVERY);
    idle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut last_activity = Instant::now();

    app.metrics().ws_sessions_active.inc(&[]);
    tracing::info!("connection opened");

    loop {
        tokio::select! {
            // broker -> this client
            delivery = deliveries.recv() => {
                match delivery {
                    Ok(msg) => {
                        let text = match ServerFrame::message(destination.as_str(), (*msg).clone()).encode() {
                            Ok(t) => t,
                            Err(e) => {
                                tracing::warn!(error = %e, "delivery encode failed");
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subscriber lagged, deliveries dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            // client -> relay
            incoming = ws_rx.next() => {
                let Some(incoming) = incoming else { break; };
                let Ok(msg) = incoming else { break; };

                last_activity = Instant::now();

                let outcome = match decode(msg, max_frame_bytes) {
                    Ok(Inbound::Frame(frame)) => dispatcher.route(conn, frame).await.map(|_| ()),
                    Ok(Inbound::Ping) | Ok(Inbound::Pong) => Ok(()),
                    Ok(Inbound::Close) => break,
                    Err(e) => Err(e),
                };

                if let Err(e) = outcome {
                    if let Some(text) = error_text(&e) {
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
            }

            _ = ping_tick.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            _ = idle_tick.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    tracing::info!("idle timeout");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    app.metrics().ws_sessions_active.dec(&[]);
    tracing::info!("connection closed");
    Ok(())
}
