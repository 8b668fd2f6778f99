//! Registry of in-flight connection handlers.
//!
//! Maps each connection to the completion handle of the task running its
//! handler. The Accept Loop inserts, the handler removes itself as part of
//! its terminal close, and the Shutdown Coordinator reads it to report
//! stragglers. A single mutex guards the slab; no critical section awaits.

use crate::pool::TaskHandle;
use chrono::{DateTime, Utc};
use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{trace, warn};

/// Identifier of a connection, stable for the lifetime of its entry.
pub type ConnectionId = usize;

#[derive(Debug)]
struct Entry {
    peer: SocketAddr,
    accepted_at: DateTime<Utc>,
    started: bool,
    /// `None` for connections run inline on the accept task.
    handle: Option<TaskHandle>,
}

/// Snapshot of a live entry, used in shutdown diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Straggler {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub accepted_at: DateTime<Utc>,
    pub started: bool,
}

/// Registry of live connections using slab allocation.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<Slab<Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve an id, run `submit` with it and record the returned handle,
    /// all inside one critical section.
    ///
    /// A handler can only remove its entry after this returns. If `submit`
    /// fails nothing is recorded and the error is handed back; anything it
    /// carries is dropped by the caller after the lock is released.
    pub fn insert_with<F, E>(&self, peer: SocketAddr, submit: F) -> Result<ConnectionId, E>
    where
        F: FnOnce(ConnectionId) -> Result<Option<TaskHandle>, E>,
    {
        let mut entries = self.lock();
        let slot = entries.vacant_entry();
        let id = slot.key();
        let handle = submit(id)?;
        slot.insert(Entry {
            peer,
            accepted_at: Utc::now(),
            started: false,
            handle,
        });
        trace!(conn = id, peer = %peer, live = entries.len(), "Connection registered");
        Ok(id)
    }

    /// Record that the handler for `id` has begun running.
    ///
    /// Takes the registry lock, so it is ordered after the insertion.
    pub fn mark_started(&self, id: ConnectionId) {
        if let Some(entry) = self.lock().get_mut(id) {
            entry.started = true;
        }
    }

    /// Remove the entry for `id`.
    ///
    /// `natural` is false when the handler did not reach its own close,
    /// for example after a forced shutdown aborted it. Such a removal of a
    /// task that is not done is reported as a straggler.
    pub fn remove(&self, id: ConnectionId, natural: bool) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.try_remove(id) else {
            return false;
        };
        let live = entries.len();
        drop(entries);

        let unfinished = entry.handle.as_ref().is_some_and(|h| !h.is_finished());
        if !natural && unfinished {
            warn!(
                conn = id,
                peer = %entry.peer,
                accepted_at = %entry.accepted_at,
                "Removing client that did not finish"
            );
        }
        trace!(conn = id, live, "Connection deregistered");
        true
    }

    /// Check if a connection is registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of live entries whose task has already exited.
    pub fn finished(&self) -> usize {
        self.lock()
            .iter()
            .filter(|(_, e)| e.handle.as_ref().is_some_and(TaskHandle::is_finished))
            .count()
    }

    /// Snapshot every live connection.
    pub fn stragglers(&self) -> Vec<Straggler> {
        self.lock()
            .iter()
            .map(|(id, e)| Straggler {
                id,
                peer: e.peer,
                accepted_at: e.accepted_at,
                started: e.started,
            })
            .collect()
    }
}
