//! Bounded pool for stage invocations
//!
//! Every stage runs on its own tokio task so a panic is caught at the join
//! and a hung stage can be abandoned. A semaphore caps how many run at once
//! across every orchestrator sharing the pool.

use crate::error::StageError;
use crate::stage::{Stage, StageContext, StageOutput};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use ulid::Ulid;
use worldline_state::WorldState;

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Concurrent invocation limit
    pub capacity: usize,
    /// Invocations currently running
    pub active_count: usize,
    /// Invocations started
    pub total_started: usize,
    /// Invocations that returned a proposal
    pub total_succeeded: usize,
    /// Invocations that failed, panicked or were abandoned
    pub total_failed: usize,
}

/// Runs stages on spawned tasks under a concurrency cap
#[derive(Debug)]
pub struct StagePool {
    capacity: usize,
    permits: Arc<Semaphore>,
    /// Running invocations by id, with their stage name
    active: DashMap<Ulid, String>,
    stats: Mutex<PoolStats>,
}

impl StagePool {
    /// Create new pool; a capacity of zero is treated as one
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            active: DashMap::new(),
            stats: Mutex::new(PoolStats {
                capacity,
                ..PoolStats::default()
            }),
        }
    }

    /// Concurrent invocation limit
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Names of stages running right now
    #[must_use]
    pub fn running(&self) -> Vec<String> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    /// Snapshot of pool statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats.lock().clone();
        stats.active_count = self.active.len();
        stats
    }

    /// Stop accepting new invocations
    pub fn close(&self) {
        self.permits.close();
    }

    /// Run `stage` on `snapshot`, waiting for a free slot first
    ///
    /// Dropping the returned future abandons the invocation and aborts its task.
    ///
    /// # Errors
    /// - `StageError::PoolClosed` if the pool was closed
    /// - `StageError::Panicked` if the stage panicked
    /// - whatever the stage itself returned
    pub async fn run(
        &self,
        stage: Arc<dyn Stage>,
        snapshot: Arc<WorldState>,
        ctx: StageContext,
    ) -> Result<StageOutput, StageError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StageError::PoolClosed)?;

        let name = ctx.stage.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            stage.run(snapshot, ctx).await
        });
        let mut guard = Invocation::start(self, name, handle.abort_handle());

        let result = match handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(StageError::Panicked(panic_message(err.into_panic()))),
            Err(_) => Err(StageError::Cancelled),
        };
        guard.finish(result.is_ok());
        result
    }
}

impl Default for StagePool {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Bookkeeping for one in-flight invocation; aborts the task if dropped early
struct Invocation<'a> {
    pool: &'a StagePool,
    id: Ulid,
    task: Option<AbortHandle>,
}

impl<'a> Invocation<'a> {
    fn start(pool: &'a StagePool, name: String, task: AbortHandle) -> Self {
        let id = Ulid::new();
        tracing::trace!(%id, stage = %name, "stage invocation started");
        pool.active.insert(id, name);
        pool.stats.lock().total_started += 1;
        Self {
            pool,
            id,
            task: Some(task),
        }
    }

    fn finish(&mut self, succeeded: bool) {
        self.task = None;
        let mut stats = self.pool.stats.lock();
        if succeeded {
            stats.total_succeeded += 1;
        } else {
            stats.total_failed += 1;
        }
    }
}

impl Drop for Invocation<'_> {
    fn drop(&mut self) {
        self.pool.active.remove(&self.id);
        if let Some(task) = self.task.take() {
            task.abort();
            self.pool.stats.lock().total_failed += 1;
            tracing::debug!(id = %self.id, "stage invocation abandoned");
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
