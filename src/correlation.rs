//! Request correlation table.
//!
//! The MCP server's replies only carry the relay's own numeric id. This table
//! maps that internal id back to the caller's id so the reply can be
//! delivered to whoever asked. Entries are consumed at most once.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::models::ExternalId;

/// Relay-generated request identifier.
pub type InternalId = u64;

/// An in-flight request awaiting a reply from the MCP server.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    /// Id the host used for this request.
    pub external_id: ExternalId,
    /// Action name that produced the request.
    pub action: String,
    /// When the request was forwarded.
    pub created_at: Instant,
    /// When the request times out, if a TTL is configured.
    pub deadline: Option<Instant>,
}

impl PendingRequest {
    /// Check whether the request has passed its deadline.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

struct Inner {
    /// Last id handed out. Ids start at 1.
    last_id: InternalId,
    pending: HashMap<InternalId, PendingRequest>,
}

/// Lock-guarded internal-id → pending-request map.
pub struct CorrelationTable {
    inner: Mutex<Inner>,
    ttl: Option<Duration>,
}

impl CorrelationTable {
    /// Create an empty table. With `ttl`, entries expire after that long.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                last_id: 0,
                pending: HashMap::new(),
            }),
            ttl,
        }
    }

    /// Configured time-to-live for pending entries.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next internal id and register a pending request for it.
    pub fn allocate(&self, external_id: ExternalId, action: impl Into<String>) -> InternalId {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.last_id += 1;
        let id = inner.last_id;
        inner.pending.insert(
            id,
            PendingRequest {
                external_id,
                action: action.into(),
                created_at: now,
                deadline: self.ttl.map(|ttl| now + ttl),
            },
        );
        debug!(internal_id = id, "Registered pending request");
        id
    }

    /// Advance the id sequence without registering anything. Used for
    /// requests the relay makes on its own behalf.
    pub fn reserve(&self) -> InternalId {
        let mut inner = self.lock();
        inner.last_id += 1;
        inner.last_id
    }

    /// Remove and return the pending request for `id`.
    pub fn resolve(&self, id: InternalId) -> Option<PendingRequest> {
        self.lock().pending.remove(&id)
    }

    /// Remove and return the oldest pending request whose caller id matches.
    pub fn resolve_external(
        &self,
        external_id: &ExternalId,
    ) -> Option<(InternalId, PendingRequest)> {
        let mut inner = self.lock();
        let id = inner
            .pending
            .iter()
            .filter(|(_, request)| &request.external_id == external_id)
            .map(|(id, _)| *id)
            .min()?;
        inner.pending.remove(&id).map(|request| (id, request))
    }

    /// Remove and return every entry whose deadline has passed, oldest first.
    pub fn expire(&self, now: Instant) -> Vec<(InternalId, PendingRequest)> {
        let mut inner = self.lock();
        let mut expired: Vec<InternalId> = inner
            .pending
            .iter()
            .filter(|(_, request)| request.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        expired
            .into_iter()
            .filter_map(|id| inner.pending.remove(&id).map(|request| (id, request)))
            .collect()
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&self) -> Vec<(InternalId, PendingRequest)> {
        let mut drained: Vec<_> = self.lock().pending.drain().collect();
        drained.sort_unstable_by_key(|(id, _)| *id);
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new(None)
    }
}
