//! Scheduling primitives and the job manager.

pub mod blocking;
pub mod error;
pub mod events;
pub mod exception;
pub mod future;
pub mod manager;
pub mod promise;
pub mod semaphore;
pub mod task;
pub mod trigger;
pub mod worker_pool;

mod timer;

pub use blocking::BlockingCondition;
pub use error::{AppResult, JobError, JobResult, UsageError};
pub use events::{build_job_event, InMemoryEventSink, JobEvent, JobEventKind, JobEventSink, SharedEventSink};
pub use exception::{ExceptionHandler, LoggingExceptionHandler};
pub use future::JobFuture;
pub use manager::{ExceptionHandling, JobInput, JobManager};
pub use promise::{CompletionPromise, DoneEvent};
pub use semaphore::{PermitSemaphore, QueuePosition, Withdrawal};
pub use task::{CancelOutcome, JobContext, JobState, TaskHandle};
pub use trigger::{FixedRateTrigger, OneShotTrigger, TriggerOracle};
#[cfg(not(target_arch = "wasm32"))]
pub use worker_pool::FixedWorkerPool;
pub use worker_pool::{OnDemandWorkerPool, PoolStats, Work, WorkerPool};
