use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};
use serde::Serialize;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::bore::telemetry;

/// How long a public connection waits for the client to claim it.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(10);

struct PendingConn<S> {
    stream: S,
    expiry: AbortHandle,
    since: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingSnapshot {
    pub id: Uuid,
    pub age_ms: u64,
}

/// Public user connections waiting for an `Accept`.
///
/// Each entry leaves the map exactly once, either through [`take`] (claim) or
/// through its expiry timer. Both go through a single `remove`, so whichever
/// runs first owns the socket and the other sees nothing. A successful claim
/// also aborts the timer.
///
/// [`take`]: PendingConnections::take
pub struct PendingConnections<S> {
    conns: DashMap<Uuid, PendingConn<S>>,
    ttl: Duration,
}

impl<S> std::fmt::Debug for PendingConnections<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnections")
            .field("len", &self.conns.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<S> PendingConnections<S>
where
    S: Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            conns: DashMap::new(),
            ttl,
        })
    }

    /// Registers `stream` under a fresh id and arms its expiry timer.
    pub fn insert(self: &Arc<Self>, stream: S) -> Uuid {
        loop {
            let id = Uuid::new_v4();
            // Holding the vacant entry keeps the timer from observing the map
            // before the connection is in it.
            let Entry::Vacant(slot) = self.conns.entry(id) else {
                continue;
            };

            let registry: Weak<Self> = Arc::downgrade(self);
            let ttl = self.ttl;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Some(registry) = registry.upgrade() {
                    registry.expire(&id);
                }
            });

            slot.insert(PendingConn {
                stream,
                expiry: timer.abort_handle(),
                since: Instant::now(),
            });
            metrics::gauge!(telemetry::PENDING_CONNECTIONS).increment(1.0);
            return id;
        }
    }

    /// Claims a pending connection, cancelling its expiry.
    pub fn take(&self, id: &Uuid) -> Option<S> {
        let (_, conn) = self.conns.remove(id)?;
        conn.expiry.abort();
        metrics::gauge!(telemetry::PENDING_CONNECTIONS).decrement(1.0);
        Some(conn.stream)
    }

    /// Drops an unclaimed connection, closing its socket. Returns false if the
    /// id was already claimed or expired.
    pub fn expire(&self, id: &Uuid) -> bool {
        let Some((_, conn)) = self.conns.remove(id) else {
            return false;
        };
        drop(conn.stream);
        metrics::gauge!(telemetry::PENDING_CONNECTIONS).decrement(1.0);
        metrics::counter!(telemetry::PENDING_EXPIRED_TOTAL).increment(1);
        tracing::info!(id = %id, "pending: removed stale connection");
        true
    }

    #[cfg(test)]
    pub fn contains(&self, id: &Uuid) -> bool {
        self.conns.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn snapshot(&self) -> Vec<PendingSnapshot> {
        let mut out: Vec<PendingSnapshot> = self
            .conns
            .iter()
            .map(|e| PendingSnapshot {
                id: *e.key(),
                age_ms: e.value().since.elapsed().as_millis() as u64,
            })
            .collect();
        out.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        out
    }
}
