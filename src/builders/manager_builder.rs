//! Builder to construct a job manager from configuration.

use std::sync::Arc;

use tracing::info;

use crate::config::{JobManagerConfig, WorkerPoolConfig, WorkerPoolKind};
use crate::core::{
    ExceptionHandler, JobError, JobEventSink, JobManager, JobResult, LoggingExceptionHandler, OnDemandWorkerPool,
    SharedEventSink, WorkerPool,
};

/// Assembles a [`JobManager`] and its collaborators.
///
/// Anything not supplied explicitly is derived from the configuration:
/// the worker pool from `worker_pool`, the exception handler defaults to
/// [`LoggingExceptionHandler`], and no event sink is installed.
#[derive(Default)]
pub struct JobManagerBuilder {
    config: JobManagerConfig,
    pool: Option<Arc<dyn WorkerPool>>,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
    events: Option<SharedEventSink>,
}

impl JobManagerBuilder {
    /// Builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder starting from `config`.
    #[must_use]
    pub fn from_config(config: JobManagerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Use `pool` instead of building one from configuration.
    #[must_use]
    pub fn with_worker_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Handler for failing rounds of tasks without their own handler.
    #[must_use]
    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// Sink receiving lifecycle events of every task.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn JobEventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Validate the configuration and start the manager.
    ///
    /// # Errors
    ///
    /// `JobError::InvalidConfig` for invalid configuration, or the error of
    /// building the worker pool or starting the timer thread.
    pub fn build(self) -> JobResult<JobManager> {
        self.config.validate().map_err(JobError::InvalidConfig)?;
        let pool = match self.pool {
            Some(pool) => pool,
            None => build_worker_pool(&self.config.worker_pool, &self.config.thread_name_prefix)?,
        };
        let handler = self
            .exception_handler
            .unwrap_or_else(|| Arc::new(LoggingExceptionHandler));
        JobManager::from_parts(self.config, pool, handler, self.events)
    }
}

impl std::fmt::Debug for JobManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManagerBuilder")
            .field("config", &self.config)
            .field("custom_pool", &self.pool.is_some())
            .field("custom_exception_handler", &self.exception_handler.is_some())
            .field("event_sink", &self.events.is_some())
            .finish()
    }
}

/// Build the worker pool selected by `cfg`.
///
/// # Errors
///
/// `JobError::InvalidConfig` for invalid configuration, for the tokio pool
/// without the `tokio-runtime` feature or outside a runtime, and for the
/// fixed pool on wasm.
pub fn build_worker_pool(cfg: &WorkerPoolConfig, thread_prefix: &str) -> JobResult<Arc<dyn WorkerPool>> {
    cfg.validate().map_err(JobError::InvalidConfig)?;
    let pool: Arc<dyn WorkerPool> = match cfg.kind {
        WorkerPoolKind::OnDemand => Arc::new(OnDemandWorkerPool::new().with_stack_size(cfg.thread_stack_size)),
        WorkerPoolKind::Fixed => build_fixed(cfg, thread_prefix)?,
        WorkerPoolKind::Tokio => build_tokio()?,
    };
    info!(kind = ?cfg.kind, worker_count = cfg.worker_count, "worker pool built");
    Ok(pool)
}

#[cfg(not(target_arch = "wasm32"))]
fn build_fixed(cfg: &WorkerPoolConfig, thread_prefix: &str) -> JobResult<Arc<dyn WorkerPool>> {
    Ok(Arc::new(crate::core::FixedWorkerPool::new(cfg, &format!("{thread_prefix}-worker"))?))
}

#[cfg(target_arch = "wasm32")]
fn build_fixed(_cfg: &WorkerPoolConfig, _thread_prefix: &str) -> JobResult<Arc<dyn WorkerPool>> {
    Err(JobError::InvalidConfig("fixed worker pool is not available on wasm".into()))
}

#[cfg(feature = "tokio-runtime")]
fn build_tokio() -> JobResult<Arc<dyn WorkerPool>> {
    Ok(Arc::new(crate::runtime::TokioWorkerPool::try_current()?))
}

#[cfg(not(feature = "tokio-runtime"))]
fn build_tokio() -> JobResult<Arc<dyn WorkerPool>> {
    Err(JobError::InvalidConfig("tokio worker pool requires the `tokio-runtime` feature".into()))
}
