//! Two-phase drain of the worker pool.
//!
//! 1. Graceful: reject new work and wait up to `drain_timeout` for queued
//!    and running handlers to finish on their own.
//! 2. Forced: abort every outstanding handler and wait up to
//!    `force_timeout` for the aborts to land.
//!
//! If the pool still has not terminated the outcome says so; whether that
//! is fatal is up to the caller.
//!
//! Dropping the drain future part way through (the caller was cancelled)
//! forces the pool immediately. The cancellation itself is not absorbed:
//! the caller's own future is the one being dropped.

use crate::connection::millis;
use crate::pool::WorkerPool;
use crate::registry::Registry;
use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

/// How the pool drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every handler finished within the graceful interval.
    Drained,
    /// Handlers had to be aborted; the pool terminated in the second interval.
    Forced,
    /// Some handler ignored the abort beyond both intervals.
    DidNotTerminate,
}

impl ShutdownOutcome {
    pub fn is_terminated(&self) -> bool {
        !matches!(self, ShutdownOutcome::DidNotTerminate)
    }
}

impl std::fmt::Display for ShutdownOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownOutcome::Drained => write!(f, "drained"),
            ShutdownOutcome::Forced => write!(f, "forced"),
            ShutdownOutcome::DidNotTerminate => write!(f, "pool did not terminate"),
        }
    }
}

/// Drains a worker pool in two bounded phases.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownCoordinator {
    drain_timeout: Duration,
    force_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration, force_timeout: Duration) -> Self {
        Self {
            drain_timeout,
            force_timeout,
        }
    }

    pub async fn drain(&self, pool: &WorkerPool, registry: &Registry) -> ShutdownOutcome {
        pool.shutdown();
        let mut guard = ForceOnDrop::new(pool);

        if pool.await_termination(self.drain_timeout).await {
            guard.disarm();
            info!("Worker pool drained");
            return ShutdownOutcome::Drained;
        }

        let now = Utc::now();
        for straggler in registry.stragglers() {
            warn!(
                conn = straggler.id,
                peer = %straggler.peer,
                started = straggler.started,
                age_ms = (now - straggler.accepted_at).num_milliseconds(),
                "Connection still running after drain timeout"
            );
        }

        let signalled = pool.force_shutdown();
        warn!(
            signalled,
            timeout_ms = millis(self.drain_timeout),
            "Worker pool did not drain in time, forcing shutdown"
        );

        let terminated = pool.await_termination(self.force_timeout).await;
        guard.disarm();

        if terminated {
            info!("Worker pool terminated after forced shutdown");
            ShutdownOutcome::Forced
        } else {
            warn!(
                outstanding = pool.outstanding(),
                "Pool did not terminate"
            );
            ShutdownOutcome::DidNotTerminate
        }
    }
}

/// Forces the pool if the drain is abandoned while waiting.
pub(crate) struct ForceOnDrop<'a> {
    pool: &'a WorkerPool,
    armed: bool,
}

impl<'a> ForceOnDrop<'a> {
    pub(crate) fn new(pool: &'a WorkerPool) -> Self {
        Self { pool, armed: true }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ForceOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let signalled = self.pool.force_shutdown();
            warn!(signalled, "Shutdown wait interrupted, forcing worker pool");
        }
    }
}
