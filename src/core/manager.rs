//! Job manager: submission, dispatch, repetition and the live registry.
//!
//! A submitted task moves through the following steps:
//!
//! 1. `submit` registers it, asks its trigger for the first fire time and
//!    either fires it right away or parks it on the timer thread.
//! 2. Firing competes for a permit of the task's permit group. The grant
//!    callback (run on whichever thread freed the permit) hands the round to
//!    the worker pool.
//! 3. The worker runs the body with an explicit [`JobContext`], releases the
//!    permit, reports failures, and either re-arms the task for the next
//!    fire time or finalizes it.
//! 4. Finalization marks the task DONE, removes it from the registry,
//!    fulfills the promise and marks it finished, in that order.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::JobManagerConfig;
use crate::core::events::{JobEventKind, SharedEventSink};
use crate::core::exception::{ExceptionHandler, LoggingExceptionHandler};
use crate::core::future::JobFuture;
use crate::core::promise::CompletionPromise;
use crate::core::semaphore::{PermitSemaphore, QueuePosition, Withdrawal};
use crate::core::task::{CancelOutcome, JobContext, JobState, TaskHandle, TaskSpec};
use crate::core::timer::Timer;
use crate::core::trigger::{OneShotTrigger, TriggerOracle};
use crate::core::worker_pool::WorkerPool;
use crate::core::{JobError, JobResult};
use crate::runtime::api::JobSnapshot;
use crate::util::clock::deadline_from;
use crate::util::ids::TaskId;

/// What the manager does with a failing round.
#[derive(Clone, Default)]
pub struct ExceptionHandling {
    /// Handler for this task; the manager's handler when `None`.
    pub handler: Option<Arc<dyn ExceptionHandler>>,
    /// Keep repeating after a failed round instead of finishing.
    pub swallow: bool,
}

impl ExceptionHandling {
    /// Report failures and keep repeating.
    #[must_use]
    pub fn swallow() -> Self {
        Self {
            handler: None,
            swallow: true,
        }
    }

    /// Report failures and finish on the first one.
    #[must_use]
    pub fn rethrow() -> Self {
        Self::default()
    }

    /// Report failures to `handler` instead of the manager's handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }
}

impl std::fmt::Debug for ExceptionHandling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionHandling")
            .field("custom_handler", &self.handler.is_some())
            .field("swallow", &self.swallow)
            .finish()
    }
}

/// Submission settings for one task.
#[derive(Clone)]
pub struct JobInput {
    name: String,
    permit_group: Option<Arc<PermitSemaphore>>,
    queue_position: Option<QueuePosition>,
    exception_handling: ExceptionHandling,
    interrupt_on_cancel: bool,
    thread_name_hint: Option<String>,
    trigger: Arc<dyn TriggerOracle>,
}

impl JobInput {
    /// Run once, immediately, without a permit group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            permit_group: None,
            queue_position: None,
            exception_handling: ExceptionHandling::default(),
            interrupt_on_cancel: false,
            thread_name_hint: None,
            trigger: Arc::new(OneShotTrigger::now()),
        }
    }

    /// Decide fire times with `trigger`.
    #[must_use]
    pub fn with_trigger(mut self, trigger: impl TriggerOracle + 'static) -> Self {
        self.trigger = Arc::new(trigger);
        self
    }

    /// Compete for permits of `group` before every round.
    #[must_use]
    pub fn with_permit_group(mut self, group: Arc<PermitSemaphore>) -> Self {
        self.permit_group = Some(group);
        self
    }

    /// Queue position used when competing for a permit.
    #[must_use]
    pub const fn with_queue_position(mut self, position: QueuePosition) -> Self {
        self.queue_position = Some(position);
        self
    }

    /// Failure policy.
    #[must_use]
    pub fn with_exception_handling(mut self, handling: ExceptionHandling) -> Self {
        self.exception_handling = handling;
        self
    }

    /// Interrupt the task when the manager cancels it in bulk.
    #[must_use]
    pub const fn with_interrupt_on_cancel(mut self, interrupt: bool) -> Self {
        self.interrupt_on_cancel = interrupt;
        self
    }

    /// Preferred worker thread name.
    #[must_use]
    pub fn with_thread_name_hint(mut self, hint: impl Into<String>) -> Self {
        self.thread_name_hint = Some(hint.into());
        self
    }

    /// Task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for JobInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobInput")
            .field("name", &self.name)
            .field("permit_group", &self.permit_group.as_ref().map(|g| g.name().to_string()))
            .field("queue_position", &self.queue_position)
            .field("exception_handling", &self.exception_handling)
            .field("interrupt_on_cancel", &self.interrupt_on_cancel)
            .field("thread_name_hint", &self.thread_name_hint)
            .finish_non_exhaustive()
    }
}

/// Type-erased view of a submitted task, as seen by the timer and registry.
pub(crate) trait ScheduledJob: Send + Sync {
    fn handle(&self) -> &TaskHandle;

    /// The fire time was reached: compete for a permit and dispatch.
    fn fire(self: Arc<Self>, fire_time: Instant);

    /// Returns false if the task was already cancelled or finished.
    fn cancel(&self, interrupt: bool) -> bool;
}

type JobBody<T> = Box<dyn FnMut(&JobContext) -> anyhow::Result<T> + Send + 'static>;

struct JobRun<T> {
    handle: TaskHandle,
    promise: CompletionPromise<T>,
    body: Mutex<JobBody<T>>,
    trigger: Arc<dyn TriggerOracle>,
    position: QueuePosition,
    exception_handling: ExceptionHandling,
    /// Set once a misfire past the end time scheduled the last round.
    final_round: AtomicBool,
    manager: Weak<ManagerShared>,
}

impl<T> JobRun<T>
where
    T: Send + Sync + 'static,
{
    fn as_scheduled(self: &Arc<Self>) -> Weak<dyn ScheduledJob> {
        let job: Arc<dyn ScheduledJob> = Arc::clone(self) as Arc<dyn ScheduledJob>;
        Arc::downgrade(&job)
    }

    fn start_on_worker(self: &Arc<Self>, fire_time: Instant) {
        let Some(manager) = self.manager.upgrade() else {
            self.release_permit();
            self.finalize(Err(JobError::Cancelled));
            return;
        };
        let hint = self
            .handle
            .thread_name_hint()
            .map_or_else(|| format!("{}-{}", manager.config.thread_name_prefix, self.handle.id()), str::to_string);
        let dispatch = RoundDispatch {
            job: Some(Arc::clone(self)),
            fire_time,
        };
        if let Err(err) = manager.pool.submit(&hint, Box::new(move || dispatch.run())) {
            warn!(task_id = self.handle.id(), task_name = %self.handle.name(), error = %err, "worker pool rejected round");
            self.release_permit();
            self.finalize(Err(err));
        }
    }

    fn run_round(self: Arc<Self>, fire_time: Instant) {
        if !self.handle.try_start() {
            self.release_permit();
            self.finalize(Err(JobError::Cancelled));
            return;
        }
        let round = self.handle.rounds_completed() + 1;
        let cx = JobContext::new(self.handle.clone(), round, fire_time);
        debug!(task_id = self.handle.id(), task_name = %self.handle.name(), round, "round started");

        let outcome = {
            let mut body = self.body.lock();
            panic::catch_unwind(AssertUnwindSafe(|| (*body)(&cx)))
        };
        self.release_permit();

        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.downcast::<JobError>().unwrap_or_else(JobError::task_failed)),
            Err(payload) => Err(JobError::task_failed(anyhow::anyhow!(
                "task panicked: {}",
                panic_message(payload.as_ref())
            ))),
        };

        if self.handle.is_cancelled() {
            debug!(task_id = self.handle.id(), round, "round ended after cancellation");
            self.finalize(Err(JobError::Cancelled));
            return;
        }

        let mut stop = false;
        if let Err(err) = &result {
            self.report_failure(err);
            stop = !self.exception_handling.swallow;
        }
        if stop || self.final_round.load(Ordering::Acquire) {
            self.finalize(result);
            return;
        }

        match self.next_fire(fire_time) {
            None => self.finalize(result),
            Some(next) => {
                if !self.handle.complete_round(next) {
                    self.finalize(Err(JobError::Cancelled));
                    return;
                }
                debug!(task_id = self.handle.id(), round, "round completed; re-armed");
                match self.manager.upgrade() {
                    Some(manager) => manager.timer.schedule(next, self.as_scheduled()),
                    None => {
                        self.cancel(false);
                    }
                }
            }
        }
    }

    /// Next fire time with the misfire policy applied.
    ///
    /// A fire time already in the past is returned unchanged, so the timer
    /// runs it immediately while the round keeps its place on the trigger's
    /// schedule. If the trigger's end time has also passed, that immediate
    /// round is the last one.
    fn next_fire(&self, last_fire_time: Instant) -> Option<Instant> {
        let now = Instant::now();
        let next = self.trigger.next_fire_time(Some(last_fire_time), now)?;
        if next > now {
            return Some(next);
        }
        if let Some(end) = self.trigger.end_time() {
            if self.trigger.is_final_round(now, end) {
                info!(
                    task_id = self.handle.id(),
                    task_name = %self.handle.name(),
                    late_by_ms = now.duration_since(next).as_millis(),
                    "misfire past end time; running one final round"
                );
                self.final_round.store(true, Ordering::Release);
                return Some(next);
            }
        }
        debug!(
            task_id = self.handle.id(),
            late_by_ms = now.duration_since(next).as_millis(),
            "misfire; running immediately"
        );
        Some(next)
    }

    fn report_failure(&self, err: &JobError) {
        let handler = self
            .exception_handling
            .handler
            .clone()
            .or_else(|| self.manager.upgrade().map(|m| Arc::clone(&m.exception_handler)));
        let handler = handler.unwrap_or_else(|| Arc::new(LoggingExceptionHandler));
        if panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&self.handle, err))).is_err() {
            warn!(task_id = self.handle.id(), "exception handler panicked");
        }
    }

    fn release_permit(&self) {
        if let Some(group) = self.handle.permit_group() {
            // Not an owner after an interrupted blocking wait; nothing to give back.
            if group.release(&self.handle).is_ok() {
                self.handle.emit(JobEventKind::PermitReleased);
            }
        }
    }

    fn finalize(&self, result: JobResult<T>) {
        if !self.handle.begin_finalize() {
            return;
        }
        self.handle.mark_done();
        if let Some(manager) = self.manager.upgrade() {
            manager.registry.remove(self.handle.id());
        }
        let outcome = match &result {
            Ok(_) => "ok",
            Err(JobError::Cancelled) => "cancelled",
            Err(_) => "failed",
        };
        self.promise.done(result);
        self.handle.mark_finished();
        info!(
            task_id = self.handle.id(),
            task_name = %self.handle.name(),
            rounds = self.handle.rounds_completed(),
            outcome,
            "task finished"
        );
    }
}

/// A round handed to the worker pool. If the pool drops it without running
/// it, the permit is given back and the task finishes with
/// `JobError::PoolShutdown`.
struct RoundDispatch<T>
where
    T: Send + Sync + 'static,
{
    job: Option<Arc<JobRun<T>>>,
    fire_time: Instant,
}

impl<T> RoundDispatch<T>
where
    T: Send + Sync + 'static,
{
    fn run(mut self) {
        if let Some(job) = self.job.take() {
            job.run_round(self.fire_time);
        }
    }
}

impl<T> Drop for RoundDispatch<T>
where
    T: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            warn!(
                task_id = job.handle.id(),
                task_name = %job.handle.name(),
                "worker pool dropped round without running it"
            );
            job.release_permit();
            job.finalize(Err(JobError::PoolShutdown));
        }
    }
}

impl<T> ScheduledJob for JobRun<T>
where
    T: Send + Sync + 'static,
{
    fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    fn fire(self: Arc<Self>, fire_time: Instant) {
        if self.handle.is_cancelled() {
            return;
        }
        let Some(group) = self.handle.permit_group().cloned() else {
            self.start_on_worker(fire_time);
            return;
        };
        let round = self.handle.rounds_completed();
        let job = Arc::clone(&self);
        let competed = group.compete(&self.handle, self.position, move || {
            job.handle.emit(JobEventKind::PermitAcquired);
            job.start_on_worker(fire_time);
        });
        match competed {
            Ok(true) => {}
            Ok(false) => {
                self.handle.mark_waiting_for_permit(round);
                // A cancel that landed before the task was queued found
                // nothing to withdraw.
                if self.handle.is_cancelled() && group.withdraw(&self.handle) == Withdrawal::Removed {
                    debug!(task_id = self.handle.id(), group = %group.name(), "cancelled competitor withdrawn");
                    self.finalize(Err(JobError::Cancelled));
                } else {
                    debug!(task_id = self.handle.id(), group = %group.name(), "waiting for permit");
                }
            }
            Err(err) => {
                warn!(task_id = self.handle.id(), error = %err, "could not compete for permit");
                self.finalize(Err(err));
            }
        }
    }

    fn cancel(&self, interrupt: bool) -> bool {
        match self.handle.cancel(interrupt) {
            CancelOutcome::AlreadyDone => false,
            CancelOutcome::Running => {
                info!(task_id = self.handle.id(), interrupt, "cancel requested for running task");
                true
            }
            CancelOutcome::NotStarted => {
                let granted = self
                    .handle
                    .permit_group()
                    .is_some_and(|group| group.withdraw(&self.handle) == Withdrawal::Owner);
                // A granted permit is already on its way to a worker, which
                // gives it back and finalizes.
                if !granted {
                    self.finalize(Err(JobError::Cancelled));
                }
                info!(task_id = self.handle.id(), interrupt, "task cancelled before running");
                true
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}

/// Live futures, keyed by task id. Entries are removed when finished.
#[derive(Default)]
struct Registry {
    jobs: Mutex<HashMap<TaskId, Arc<dyn ScheduledJob>>>,
    idle: Condvar,
}

impl Registry {
    fn insert(&self, id: TaskId, job: Arc<dyn ScheduledJob>) {
        self.jobs.lock().insert(id, job);
    }

    fn remove(&self, id: TaskId) {
        let mut jobs = self.jobs.lock();
        jobs.remove(&id);
        if jobs.is_empty() {
            self.idle.notify_all();
        }
    }

    fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    fn contains(&self, id: TaskId) -> bool {
        self.jobs.lock().contains_key(&id)
    }

    fn all(&self) -> Vec<Arc<dyn ScheduledJob>> {
        self.jobs.lock().values().cloned().collect()
    }

    fn await_empty(&self, timeout: Option<Duration>) -> JobResult<()> {
        let deadline = deadline_from(timeout);
        let mut jobs = self.jobs.lock();
        while !jobs.is_empty() {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut jobs, deadline).timed_out() && !jobs.is_empty() {
                        return Err(JobError::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => self.idle.wait(&mut jobs),
            }
        }
        Ok(())
    }
}

pub(crate) struct ManagerShared {
    registry: Registry,
    timer: Timer,
    pool: Arc<dyn WorkerPool>,
    exception_handler: Arc<dyn ExceptionHandler>,
    events: Option<SharedEventSink>,
    config: JobManagerConfig,
    shut_down: AtomicBool,
}

/// Accepts task submissions and drives them to completion.
///
/// Collaborators (worker pool, exception handler, event sink) are injected
/// at construction; see [`crate::builders::JobManagerBuilder`].
pub struct JobManager {
    shared: Arc<ManagerShared>,
}

impl JobManager {
    /// Manager with default configuration dispatching to `pool`.
    ///
    /// # Errors
    ///
    /// `JobError::Internal` if the timer thread cannot be spawned.
    pub fn new(pool: Arc<dyn WorkerPool>) -> JobResult<Self> {
        Self::from_parts(JobManagerConfig::default(), pool, Arc::new(LoggingExceptionHandler), None)
    }

    pub(crate) fn from_parts(
        config: JobManagerConfig,
        pool: Arc<dyn WorkerPool>,
        exception_handler: Arc<dyn ExceptionHandler>,
        events: Option<SharedEventSink>,
    ) -> JobResult<Self> {
        let timer = Timer::start(format!("{}-timer", config.thread_name_prefix))?;
        info!(
            thread_name_prefix = %config.thread_name_prefix,
            default_queue_position = ?config.default_queue_position,
            "job manager started"
        );
        Ok(Self {
            shared: Arc::new(ManagerShared {
                registry: Registry::default(),
                timer,
                pool,
                exception_handler,
                events,
                config,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Submit a task.
    ///
    /// The body runs once per round with the round's [`JobContext`]. Its
    /// error is reported to the exception handler; an error that is a
    /// [`JobError`] is kept as is, anything else becomes
    /// `JobError::TaskFailed`. Panics are caught and reported the same way.
    ///
    /// # Errors
    ///
    /// `JobError::PoolShutdown` after [`JobManager::shutdown`].
    pub fn submit<T, F>(&self, input: JobInput, body: F) -> JobResult<JobFuture<T>>
    where
        T: Send + Sync + 'static,
        F: FnMut(&JobContext) -> anyhow::Result<T> + Send + 'static,
    {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(JobError::PoolShutdown);
        }
        let handle = TaskHandle::from_spec(TaskSpec {
            name: input.name,
            permit_group: input.permit_group,
            interrupt_on_cancel: input.interrupt_on_cancel,
            thread_name_hint: input.thread_name_hint,
            events: self.shared.events.clone(),
        });
        let promise = CompletionPromise::new(handle.id(), handle.name());
        let job = Arc::new(JobRun {
            handle: handle.clone(),
            promise: promise.clone(),
            body: Mutex::new(Box::new(body) as JobBody<T>),
            trigger: input.trigger,
            position: input.queue_position.unwrap_or(self.shared.config.default_queue_position),
            exception_handling: input.exception_handling,
            final_round: AtomicBool::new(false),
            manager: Arc::downgrade(&self.shared),
        });
        let scheduled: Arc<dyn ScheduledJob> = Arc::clone(&job) as Arc<dyn ScheduledJob>;
        self.shared.registry.insert(handle.id(), Arc::clone(&scheduled));
        handle.emit(JobEventKind::Submitted);
        handle.set_single_execution(job.trigger.is_single_execution());
        handle.advance(JobState::Scheduled);
        info!(
            task_id = handle.id(),
            task_name = %handle.name(),
            correlation_id = %handle.correlation_id(),
            permit_group = handle.permit_group().map(|g| g.name()),
            "task submitted"
        );

        let future = JobFuture::new(handle.clone(), promise, Arc::downgrade(&scheduled));
        let now = Instant::now();
        match job.trigger.next_fire_time(None, now) {
            None => {
                info!(task_id = handle.id(), "trigger has no fire time; task will not run");
                job.finalize(Err(JobError::Cancelled));
            }
            Some(at) if at > now => {
                if handle.set_pending(at) {
                    self.shared.timer.schedule(at, Arc::downgrade(&scheduled));
                }
            }
            Some(at) => scheduled.fire(at),
        }
        Ok(future)
    }

    /// Whether submissions are accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        !self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Number of submitted, not yet finished tasks.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Whether the task with `id` is still registered.
    #[must_use]
    pub fn is_registered(&self, id: TaskId) -> bool {
        self.shared.registry.contains(id)
    }

    /// Fire times waiting on the timer thread.
    #[must_use]
    pub fn pending_fire_times(&self) -> usize {
        self.shared.timer.pending()
    }

    /// Point-in-time view of every registered task, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        let mut snapshots: Vec<_> = self
            .shared
            .registry
            .all()
            .iter()
            .map(|job| JobSnapshot::from_handle(job.handle()))
            .collect();
        snapshots.sort_by_key(|s| s.task_id);
        snapshots
    }

    /// Worker pool statistics.
    #[must_use]
    pub fn pool_stats(&self) -> crate::core::worker_pool::PoolStats {
        self.shared.pool.stats()
    }

    /// Cancel every registered task, interrupting those submitted with
    /// `interrupt_on_cancel`. Returns how many cancellations took effect.
    pub fn cancel_all(&self) -> usize {
        let jobs = self.shared.registry.all();
        let cancelled = jobs
            .iter()
            .filter(|job| job.cancel(job.handle().interrupt_on_cancel()))
            .count();
        info!(cancelled, "cancelled all registered tasks");
        cancelled
    }

    /// Block until no task is registered.
    ///
    /// # Errors
    ///
    /// `JobError::Timeout` if `timeout` elapses first.
    pub fn await_idle(&self, timeout: Option<Duration>) -> JobResult<()> {
        self.shared.registry.await_empty(timeout)
    }

    /// Reject new submissions, cancel registered tasks, wait up to the
    /// configured shutdown timeout for them to finish, then stop the timer
    /// thread and the worker pool.
    ///
    /// # Errors
    ///
    /// `JobError::Timeout` if tasks were still running when the timeout
    /// elapsed. The timer and pool are stopped regardless.
    pub fn shutdown(&self) -> JobResult<()> {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(registered = self.registered_count(), "job manager shutting down");
        self.cancel_all();
        let timeout = Duration::from_millis(self.shared.config.shutdown_timeout_ms);
        let idle = self.await_idle(Some(timeout));
        if idle.is_err() {
            warn!(registered = self.registered_count(), "tasks still running at shutdown timeout");
        }
        self.shared.timer.shutdown();
        self.shared.pool.shutdown();
        info!("job manager shut down");
        idle
    }

    /// Manager configuration.
    #[must_use]
    pub fn config(&self) -> &JobManagerConfig {
        &self.shared.config
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        if !self.shared.shut_down.swap(true, Ordering::AcqRel) {
            self.cancel_all();
            self.shared.timer.stop();
            debug!("job manager dropped without explicit shutdown");
        }
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("registered", &self.registered_count())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}
