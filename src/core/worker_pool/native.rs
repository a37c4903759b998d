//! Fixed-size worker pool on dedicated OS threads.
//!
//! Workers block on a bounded crossbeam channel; dropping the sender on
//! shutdown unblocks idle workers, which then exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::WorkerPoolConfig;
use crate::core::{JobError, JobResult};

use super::{PoolCounters, PoolStats, Work, WorkerPool};

/// How long shutdown waits for each worker before detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Worker pool with a fixed number of dedicated threads.
///
/// Thread names are fixed at `{prefix}-{index}`; per-round name hints are
/// only logged.
pub struct FixedWorkerPool {
    worker_count: usize,
    /// Option allows clean shutdown by dropping the sender.
    task_tx: Mutex<Option<Sender<Work>>>,
    counters: Arc<PoolCounters>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FixedWorkerPool {
    /// Spawn `config.worker_count` threads named `{thread_prefix}-{index}`.
    ///
    /// # Errors
    ///
    /// `JobError::InvalidConfig` if the configuration is invalid, or
    /// `JobError::Internal` if a thread could not be spawned.
    pub fn new(config: &WorkerPoolConfig, thread_prefix: &str) -> JobResult<Self> {
        config.validate().map_err(JobError::InvalidConfig)?;

        let (task_tx, task_rx) = bounded::<Work>(config.max_queue_depth);
        let counters = Arc::new(PoolCounters::default());

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let worker = spawn_worker(
                worker_id,
                format!("{thread_prefix}-{worker_id}"),
                task_rx.clone(),
                Arc::clone(&counters),
                config.thread_stack_size,
            );
            match worker {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    // Workers already spawned exit once the sender is gone.
                    drop(task_tx);
                    return Err(err);
                }
            }
        }

        info!(
            worker_count = config.worker_count,
            max_queue_depth = config.max_queue_depth,
            "fixed worker pool initialized"
        );

        Ok(Self {
            worker_count: config.worker_count,
            task_tx: Mutex::new(Some(task_tx)),
            counters,
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(workers),
        })
    }
}

impl WorkerPool for FixedWorkerPool {
    fn submit(&self, thread_name_hint: &str, work: Work) -> JobResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(JobError::PoolShutdown);
        }
        let task_tx_guard = self.task_tx.lock();
        let Some(task_tx) = task_tx_guard.as_ref() else {
            return Err(JobError::PoolShutdown);
        };
        self.counters.accepted();
        match task_tx.try_send(work) {
            Ok(()) => {
                trace!(hint = thread_name_hint, "work queued on fixed pool");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.rejected();
                warn!(hint = thread_name_hint, "fixed worker pool queue is full");
                Err(JobError::Internal("worker queue is full".into()))
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.rejected();
                Err(JobError::PoolShutdown)
            }
        }
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.worker_count)
    }

    /// Drop the sender so idle workers exit, then join each worker, detaching
    /// any that does not exit within two seconds.
    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down fixed worker pool");
        self.task_tx.lock().take();

        let mut workers = self.workers.lock();
        let worker_count = workers.len();
        for (idx, worker) in workers.drain(..).enumerate() {
            if worker.thread().id() == thread::current().id() {
                debug!(worker_id = idx, "shutdown called from a worker; detaching it");
                continue;
            }
            let (tx, rx) = crossbeam_channel::bounded(1);
            let join_thread = thread::spawn(move || {
                let _ = tx.send(worker.join().is_ok());
            });
            match rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(true) => debug!(worker_id = idx, "worker joined"),
                Ok(false) => warn!(worker_id = idx, "worker panicked"),
                Err(_) => warn!(worker_id = idx, "worker did not exit within timeout; detaching"),
            }
            drop(join_thread);
        }
        info!(worker_count, "fixed worker pool shut down");
    }
}

impl Drop for FixedWorkerPool {
    fn drop(&mut self) {
        // Signal only; joining here could hang on a round that never ends.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.task_tx.lock().take();
            debug!("fixed worker pool dropped without explicit shutdown; workers detached");
        }
    }
}

impl std::fmt::Debug for FixedWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWorkerPool")
            .field("worker_count", &self.worker_count)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn spawn_worker(
    worker_id: usize,
    name: String,
    task_rx: Receiver<Work>,
    counters: Arc<PoolCounters>,
    stack_size: usize,
) -> JobResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(name)
        .stack_size(stack_size)
        .spawn(move || {
            debug!(worker_id, "worker thread started");
            // recv fails once the sender is dropped.
            while let Ok(work) = task_rx.recv() {
                counters.run(work);
            }
            debug!(worker_id, "worker thread exiting");
        })
        .map_err(|e| JobError::Internal(format!("failed to spawn worker thread: {e}")))
}
