//! # Prometheus Job Manager
//!
//! Permit-based job scheduling core: many independently submitted tasks
//! cooperatively share a bounded number of execution permits.
//!
//! ## Building Blocks
//!
//! - **[`PermitSemaphore`](core::PermitSemaphore)**: counting semaphore with
//!   a fair competitor queue (FIFO, with head-of-queue insertion), adjustable
//!   capacity and non-blocking `compete` with acquired-callbacks.
//! - **[`BlockingCondition`](core::BlockingCondition)**: lets a running task
//!   park itself; its permit is released while parked and re-acquired before
//!   the task resumes.
//! - **[`JobFuture`](core::JobFuture)** and
//!   **[`CompletionPromise`](core::CompletionPromise)**: lifecycle state,
//!   cancellation, blocking and async waits, done-handlers.
//! - **[`JobManager`](core::JobManager)**: asks a
//!   [`TriggerOracle`](core::TriggerOracle) when to run, arranges permits,
//!   dispatches rounds to a [`WorkerPool`](core::WorkerPool), repeats and
//!   finalizes.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use prometheus_job_manager::builders::JobManagerBuilder;
//! use prometheus_job_manager::core::{AppResult, JobInput, PermitSemaphore};
//!
//! fn main() -> AppResult<()> {
//!     let manager = JobManagerBuilder::new().build()?;
//!     let gpu = PermitSemaphore::new("gpu", 2);
//!
//!     let future = manager.submit(
//!         JobInput::new("embed-batch").with_permit_group(Arc::clone(&gpu)),
//!         |cx| {
//!             cx.check_interrupted()?;
//!             Ok(42_u32)
//!         },
//!     )?;
//!     assert_eq!(future.await_done_and_get(Some(Duration::from_secs(5)))?, 42);
//!     manager.shutdown()?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Scheduling primitives and the job manager.
pub mod core;
/// Configuration models for the job manager and its worker pool.
pub mod config;
/// Builders to construct a job manager from configuration.
pub mod builders;
/// Runtime adapters and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
