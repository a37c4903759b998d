//! Submitter-side view of a task: lifecycle queries, cancellation and
//! result retrieval.

use std::fmt;
use std::sync::Weak;
use std::time::{Duration, Instant};

use crate::core::manager::ScheduledJob;
use crate::core::promise::{CompletionPromise, DoneEvent};
use crate::core::task::{JobState, TaskHandle};
use crate::core::JobResult;
use crate::util::ids::TaskId;

/// Handle returned by [`crate::core::JobManager::submit`].
///
/// Lifecycle queries read the task's control block; the final result is
/// delivered through the attached [`CompletionPromise`]. Clones observe the
/// same task.
pub struct JobFuture<T> {
    handle: TaskHandle,
    promise: CompletionPromise<T>,
    job: Weak<dyn ScheduledJob>,
}

impl<T> Clone for JobFuture<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            promise: self.promise.clone(),
            job: Weak::clone(&self.job),
        }
    }
}

impl<T> JobFuture<T> {
    pub(crate) const fn new(handle: TaskHandle, promise: CompletionPromise<T>, job: Weak<dyn ScheduledJob>) -> Self {
        Self { handle, promise, job }
    }

    /// Task id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    /// Task name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// The task's control handle.
    #[must_use]
    pub const fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    /// The promise carrying the final result.
    #[must_use]
    pub const fn promise(&self) -> &CompletionPromise<T> {
        &self.promise
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.handle.state()
    }

    /// True while the state is DONE. Repeating tasks leave DONE again when
    /// re-armed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.handle.state() == JobState::Done
    }

    /// True once no further execution will occur.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// True once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Next scheduled fire time while more rounds are planned.
    #[must_use]
    pub fn next_execution(&self) -> Option<Instant> {
        self.handle.next_execution()
    }

    /// Whether the task has exactly one scheduled run.
    #[must_use]
    pub fn is_single_execution(&self) -> bool {
        self.handle.is_single_execution()
    }

    /// Completed rounds so far.
    #[must_use]
    pub fn rounds_completed(&self) -> u64 {
        self.handle.rounds_completed()
    }

    /// Cancel the task.
    ///
    /// A task that has not started its current round goes straight to DONE
    /// and finished with result `JobError::Cancelled`. A running task is
    /// marked cancelled and, if `interrupt` is set, interrupted; it reaches
    /// DONE when its body returns. Returns false if the task was already
    /// cancelled or finished.
    pub fn cancel(&self, interrupt: bool) -> bool {
        self.job.upgrade().is_some_and(|job| job.cancel(interrupt))
    }

    /// Block until the current round reaches DONE.
    ///
    /// # Errors
    ///
    /// `JobError::Timeout` if `timeout` elapses first.
    pub fn await_done(&self, timeout: Option<Duration>) -> JobResult<()> {
        self.handle.await_done(timeout)
    }

    /// Block until the task is finished.
    ///
    /// # Errors
    ///
    /// `JobError::Timeout` if `timeout` elapses first.
    pub fn await_finished(&self, timeout: Option<Duration>) -> JobResult<()> {
        self.handle.await_finished(timeout)
    }

    /// Block for the final result.
    ///
    /// # Errors
    ///
    /// The task's failure, `JobError::Cancelled`, or `JobError::Timeout`.
    pub fn await_done_and_get(&self, timeout: Option<Duration>) -> JobResult<T>
    where
        T: Clone,
    {
        self.promise.await_done_and_get(timeout)
    }

    /// Final result, if available.
    pub fn try_get(&self) -> Option<JobResult<T>>
    where
        T: Clone,
    {
        self.promise.try_get()
    }

    /// Register a handler for the final result. See
    /// [`CompletionPromise::when_done`] for which thread runs it.
    pub fn when_done<F>(&self, handler: F)
    where
        F: FnOnce(&DoneEvent<'_, T>) + Send + 'static,
    {
        self.promise.when_done(handler);
    }
}

#[cfg(feature = "tokio-runtime")]
impl<T> JobFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Await the final result from async code.
    ///
    /// # Errors
    ///
    /// See [`CompletionPromise::await_done_and_get_async`].
    pub async fn await_done_and_get_async(&self, timeout: Duration) -> JobResult<T> {
        self.promise.await_done_and_get_async(timeout).await
    }
}

impl<T> fmt::Debug for JobFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobFuture")
            .field("id", &self.handle.id())
            .field("name", &self.handle.name())
            .field("state", &self.handle.state())
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}
