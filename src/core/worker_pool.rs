//! Worker pools that execute task rounds.
//!
//! The job manager does not size or own threads. It hands each round to a
//! [`WorkerPool`] together with a thread name hint:
//!
//! - [`OnDemandWorkerPool`] spawns a named OS thread per round. Rounds never
//!   wait for a free worker, so tasks parked on a blocking condition cannot
//!   starve other work.
//! - [`FixedWorkerPool`] (native only) runs rounds on a fixed set of threads
//!   fed by a bounded channel.
//! - `TokioWorkerPool` (feature `tokio-runtime`, in `runtime`) uses tokio's
//!   blocking thread pool.
//!
//! A round parked on a blocking condition occupies its worker thread. With
//! a fixed pool, size the pool above the total permit count of the groups
//! it serves.

#[cfg(not(target_arch = "wasm32"))]
mod native;
mod on_demand;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::JobResult;

/// Unit of work handed to a pool.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Supplies threads for task rounds.
pub trait WorkerPool: Send + Sync {
    /// Run `work` on a worker thread, named after `thread_name_hint` where
    /// the pool supports it. Must not block the caller.
    ///
    /// # Errors
    ///
    /// `JobError::PoolShutdown` after shutdown, or `JobError::Internal` if
    /// the work could not be handed off.
    fn submit(&self, thread_name_hint: &str, work: Work) -> JobResult<()>;

    /// Current utilization counters.
    fn stats(&self) -> PoolStats;

    /// Stop accepting work and release worker threads.
    fn shutdown(&self);
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Number of worker threads; zero for pools that spawn on demand.
    pub worker_count: usize,
    /// Currently executing work items.
    pub active_tasks: u64,
    /// Work items waiting for a worker.
    pub queued_tasks: u64,
    /// Work items that returned normally.
    pub completed_tasks: u64,
    /// Work items that panicked.
    pub failed_tasks: u64,
    /// Work items accepted.
    pub submitted_tasks: u64,
}

/// Internal counters for pool statistics.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub active_tasks: AtomicU64,
    pub queued_tasks: AtomicU64,
    pub completed_tasks: AtomicU64,
    pub failed_tasks: AtomicU64,
    pub submitted_tasks: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            submitted_tasks: self.submitted_tasks.load(Ordering::Relaxed),
        }
    }

    pub fn accepted(&self) {
        self.submitted_tasks.fetch_add(1, Ordering::Relaxed);
        self.queued_tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo [`PoolCounters::accepted`] for work that could not be handed off.
    pub fn rejected(&self) {
        self.submitted_tasks.fetch_sub(1, Ordering::Relaxed);
        self.queued_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    /// Run one work item, keeping the counters current. Panics are contained.
    pub fn run(&self, work: Work) {
        self.queued_tasks.fetch_sub(1, Ordering::Relaxed);
        self.active_tasks.fetch_add(1, Ordering::Relaxed);
        let outcome = panic::catch_unwind(AssertUnwindSafe(work));
        self.active_tasks.fetch_sub(1, Ordering::Relaxed);
        if outcome.is_ok() {
            self.completed_tasks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_tasks.fetch_add(1, Ordering::Relaxed);
            tracing::error!("work item panicked on worker thread");
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use native::FixedWorkerPool;
pub use on_demand::OnDemandWorkerPool;
