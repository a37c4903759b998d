//! Completion promise: a single-assignment result cell with done-handlers.
//!
//! Handlers registered before fulfillment run once, in registration order,
//! on the thread that fulfills the promise. Handlers registered afterwards
//! run immediately on the registering thread. Neither kind runs while the
//! promise's lock is held, so a handler may freely query the promise.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::core::{JobError, JobResult};
use crate::util::clock::deadline_from;
use crate::util::ids::TaskId;

/// What a done-handler observes.
#[derive(Debug)]
pub struct DoneEvent<'a, T> {
    /// Id of the completed task.
    pub task_id: TaskId,
    /// Name of the completed task.
    pub task_name: &'a str,
    /// Final result.
    pub result: &'a JobResult<T>,
}

impl<T> DoneEvent<'_, T> {
    /// Whether the task ended by cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.result, Err(JobError::Cancelled))
    }

    /// Whether the task produced a value.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

type DoneHandler<T> = Box<dyn FnOnce(&DoneEvent<'_, T>) + Send + 'static>;

struct PromiseState<T> {
    result: Option<Arc<JobResult<T>>>,
    handlers: Vec<DoneHandler<T>>,
}

struct PromiseInner<T> {
    task_id: TaskId,
    task_name: String,
    state: Mutex<PromiseState<T>>,
    fulfilled: Condvar,
}

/// Single-assignment result cell of one task future.
pub struct CompletionPromise<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Clone for CompletionPromise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> CompletionPromise<T> {
    /// Create an unfulfilled promise for the given task.
    pub fn new(task_id: TaskId, task_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                task_id,
                task_name: task_name.into(),
                state: Mutex::new(PromiseState {
                    result: None,
                    handlers: Vec::new(),
                }),
                fulfilled: Condvar::new(),
            }),
        }
    }

    /// Whether the promise has been fulfilled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().result.is_some()
    }

    /// Fulfill the promise, wake all waiters and run queued handlers on
    /// the calling thread in registration order.
    ///
    /// Returns `false` and leaves the promise untouched if it was fulfilled
    /// already.
    pub fn done(&self, result: JobResult<T>) -> bool {
        let (result, handlers) = {
            let mut st = self.inner.state.lock();
            if st.result.is_some() {
                drop(st);
                warn!(task_id = self.inner.task_id, "promise already fulfilled; result dropped");
                return false;
            }
            let result = Arc::new(result);
            st.result = Some(Arc::clone(&result));
            let handlers = std::mem::take(&mut st.handlers);
            self.inner.fulfilled.notify_all();
            (result, handlers)
        };
        for handler in handlers {
            self.invoke(handler, &result);
        }
        true
    }

    /// Register a done-handler.
    ///
    /// Runs synchronously before returning if the promise is fulfilled,
    /// otherwise later on the fulfilling thread.
    pub fn when_done<F>(&self, handler: F)
    where
        F: FnOnce(&DoneEvent<'_, T>) + Send + 'static,
    {
        let mut st = self.inner.state.lock();
        match st.result.clone() {
            Some(result) => {
                drop(st);
                self.invoke(Box::new(handler), &result);
            }
            None => st.handlers.push(Box::new(handler)),
        }
    }

    /// Block until fulfilled, without reading the result.
    ///
    /// # Errors
    ///
    /// `JobError::Timeout` if `timeout` elapses first.
    pub fn await_done(&self, timeout: Option<Duration>) -> JobResult<()> {
        self.wait(timeout).map(|_| ())
    }

    /// The result if fulfilled.
    pub fn try_get(&self) -> Option<JobResult<T>>
    where
        T: Clone,
    {
        self.inner.state.lock().result.as_deref().cloned()
    }

    /// Block until fulfilled and return the result. Returns immediately if
    /// already fulfilled. Every caller receives the same result.
    ///
    /// # Errors
    ///
    /// The task's failure, or `JobError::Timeout` if `timeout` elapses first.
    pub fn await_done_and_get(&self, timeout: Option<Duration>) -> JobResult<T>
    where
        T: Clone,
    {
        let result = self.wait(timeout)?;
        (*result).clone()
    }

    fn wait(&self, timeout: Option<Duration>) -> JobResult<Arc<JobResult<T>>> {
        let deadline = deadline_from(timeout);
        let mut st = self.inner.state.lock();
        loop {
            if let Some(result) = &st.result {
                return Ok(Arc::clone(result));
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.fulfilled.wait_until(&mut st, deadline).timed_out() && st.result.is_none() {
                        return Err(JobError::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => self.inner.fulfilled.wait(&mut st),
            }
        }
    }

    fn invoke(&self, handler: DoneHandler<T>, result: &JobResult<T>) {
        let event = DoneEvent {
            task_id: self.inner.task_id,
            task_name: &self.inner.task_name,
            result,
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
            error!(task_id = self.inner.task_id, task = %self.inner.task_name, "done-handler panicked");
        }
    }
}

#[cfg(feature = "tokio-runtime")]
impl<T> CompletionPromise<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Await the result from async code.
    ///
    /// The condition-variable wait runs on tokio's blocking pool.
    ///
    /// # Errors
    ///
    /// The task's failure, `JobError::Timeout`, or `JobError::Internal` if the
    /// blocking wait could not be joined.
    pub async fn await_done_and_get_async(&self, timeout: Duration) -> JobResult<T> {
        let promise = self.clone();
        tokio::task::spawn_blocking(move || promise.await_done_and_get(Some(timeout)))
            .await
            .map_err(|e| JobError::Internal(format!("blocking wait failed: {e}")))?
    }
}

impl<T> fmt::Debug for CompletionPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionPromise")
            .field("task_id", &self.inner.task_id)
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_second_fulfillment_is_ignored() {
        let promise = CompletionPromise::new(1, "once");
        assert!(promise.done(Ok(1)));
        assert!(!promise.done(Ok(2)));
        assert_eq!(promise.await_done_and_get(None).unwrap(), 1);
    }

    #[test]
    fn test_handlers_run_in_registration_order_on_fulfilling_thread() {
        let promise = CompletionPromise::<u32>::new(2, "ordered");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            promise.when_done(move |event| {
                seen.lock().push((i, thread::current().name().map(str::to_string), *event.result.as_ref().unwrap()));
            });
        }
        let fulfiller = promise.clone();
        thread::Builder::new()
            .name("fulfiller".into())
            .spawn(move || fulfiller.done(Ok(7)))
            .unwrap()
            .join()
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        for (index, (i, thread_name, value)) in seen.iter().enumerate() {
            assert_eq!(*i, index);
            assert_eq!(thread_name.as_deref(), Some("fulfiller"));
            assert_eq!(*value, 7);
        }
    }

    #[test]
    fn test_late_handler_runs_synchronously() {
        let promise = CompletionPromise::new(3, "late");
        promise.done(Err::<u8, _>(JobError::Cancelled));
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        promise.when_done(move |event| {
            assert!(event.is_cancelled());
            *flag.lock() = true;
        });
        assert!(*ran.lock());
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let promise = CompletionPromise::new(4, "panicky");
        let ran = Arc::new(Mutex::new(false));
        promise.when_done(|_| panic!("handler failure"));
        let flag = Arc::clone(&ran);
        promise.when_done(move |_| *flag.lock() = true);
        assert!(promise.done(Ok(())));
        assert!(*ran.lock());
    }

    #[test]
    fn test_wait_times_out() {
        let promise = CompletionPromise::<()>::new(5, "slow");
        let err = promise.await_done_and_get(Some(Duration::from_millis(10))).unwrap_err();
        assert!(err.is_timeout());
        assert!(promise.try_get().is_none());
    }
}
