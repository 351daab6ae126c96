//! Wire protocols.
//!
//! - `frame`: JSON frames exchanged with WebSocket clients.
//! - `stomp`: STOMP 1.2 frames exchanged with the external broker.
//!
//! Both decoders are panic-free: malformed input is reported as `RelayError`
//! instead of panicking or indexing raw buffers.

pub mod frame;
pub mod stomp;
