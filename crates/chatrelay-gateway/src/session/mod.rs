//! Per-connection identity tracking.
//!
//! Connection ids are allocated by the transport; the registry binds the
//! display name announced at JOIN to that id so the disconnect path can
//! recover it.

mod registry;

pub use registry::{ConnectionId, ConnectionIds, SessionRegistry};
