//! Thread-per-round worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::core::{JobError, JobResult};

use super::{PoolCounters, PoolStats, Work, WorkerPool};

/// Spawns one named OS thread for every submitted work item.
#[derive(Debug, Default)]
pub struct OnDemandWorkerPool {
    stack_size: Option<usize>,
    counters: Arc<PoolCounters>,
    shutdown: AtomicBool,
}

impl OnDemandWorkerPool {
    /// Create a pool using the platform default stack size.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `stack_size` bytes of stack for every spawned thread.
    #[must_use]
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }
}

impl WorkerPool for OnDemandWorkerPool {
    fn submit(&self, thread_name_hint: &str, work: Work) -> JobResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(JobError::PoolShutdown);
        }
        let mut builder = thread::Builder::new().name(thread_name_hint.to_string());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        self.counters.accepted();
        let counters = Arc::clone(&self.counters);
        match builder.spawn(move || counters.run(work)) {
            Ok(_) => {
                debug!(thread = thread_name_hint, "spawned worker thread");
                Ok(())
            }
            Err(e) => {
                self.counters.rejected();
                warn!(thread = thread_name_hint, error = %e, "failed to spawn worker thread");
                Err(JobError::Internal(format!("failed to spawn worker thread: {e}")))
            }
        }
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot(0)
    }

    fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!("on-demand worker pool shut down");
        }
    }
}
