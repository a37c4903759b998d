//! Worker pool backed by tokio's blocking thread pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, trace};

use crate::core::worker_pool::PoolCounters;
use crate::core::{JobError, JobResult, PoolStats, Work, WorkerPool};

/// Runs rounds with `spawn_blocking` on a tokio runtime.
///
/// Tokio names its blocking threads itself; name hints are only logged.
#[derive(Debug, Clone)]
pub struct TokioWorkerPool {
    handle: tokio::runtime::Handle,
    counters: Arc<PoolCounters>,
    shutdown: Arc<AtomicBool>,
}

impl TokioWorkerPool {
    /// Create a pool from a tokio runtime handle.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            counters: Arc::new(PoolCounters::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a pool on the runtime the caller is running in.
    ///
    /// # Errors
    ///
    /// `JobError::InvalidConfig` outside a tokio runtime.
    pub fn try_current() -> JobResult<Self> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| JobError::InvalidConfig(format!("tokio worker pool needs a runtime: {e}")))
    }
}

impl WorkerPool for TokioWorkerPool {
    fn submit(&self, thread_name_hint: &str, work: Work) -> JobResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(JobError::PoolShutdown);
        }
        self.counters.accepted();
        let counters = Arc::clone(&self.counters);
        trace!(hint = thread_name_hint, "spawning blocking round");
        drop(self.handle.spawn_blocking(move || counters.run(work)));
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot(0)
    }

    fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!("tokio worker pool shut down");
        }
    }
}
