//! Decode-once codec for the transport layer.
//!
//! - Text frames => `ClientFrame` (size-checked before parsing)
//! - Binary frames => rejected, the relay speaks JSON text only
//! - Ping/Pong/Close are surfaced for lifecycle management

use axum::extract::ws::Message;
use chatrelay_core::{
    error::{Result, RelayError},
    protocol::frame::ClientFrame,
};

#[derive(Debug)]
pub enum Inbound {
    Frame(ClientFrame),
    Ping,
    Pong,
    Close,
}

pub fn decode(msg: Message, max_frame_bytes: usize) -> Result<Inbound> {
    match msg {
        Message::Text(s) => {
            if s.len() > max_frame_bytes {
                return Err(RelayError::Protocol(format!(
                    "frame too large: {} > {max_frame_bytes} bytes",
                    s.len()
                )));
            }
            Ok(Inbound::Frame(ClientFrame::decode(&s)?))
        }
        Message::Binary(_) => Err(RelayError::Protocol(
            "binary frames are not supported".into(),
        )),
        Message::Ping(_) => Ok(Inbound::Ping),
        Message::Pong(_) => Ok(Inbound::Pong),
        Message::Close(_) => Ok(Inbound::Close),
    }
}
