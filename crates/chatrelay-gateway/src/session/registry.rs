use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Opaque handle for one live client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Monotonic connection id allocator. Ids are never reused within a process.
#[derive(Debug)]
pub struct ConnectionIds {
    seq: AtomicU64,
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.seq.fetch_add(1, Ordering::Relaxed))
    }
}

/// Session registry: `connection -> sender bound at JOIN`.
///
/// Sharded map, so binds and evictions from different connections never
/// contend on one lock.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Bind `sender` to `conn`. A re-join overwrites (last writer wins).
    pub fn bind(&self, conn: ConnectionId, sender: impl Into<String>) {
        let sender = sender.into();
        if let Some(prev) = self.sessions.insert(conn, sender) {
            tracing::debug!(%conn, prev = %prev, "session rebound");
        }
    }

    pub fn lookup(&self, conn: ConnectionId) -> Option<String> {
        self.sessions.get(&conn).map(|r| r.value().clone())
    }

    /// Remove and return the binding in one step.
    ///
    /// Evicting an id that is not bound (never joined, or already evicted)
    /// returns `None`.
    pub fn evict(&self, conn: ConnectionId) -> Option<String> {
        self.sessions.remove(&conn).map(|(_, sender)| sender)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
