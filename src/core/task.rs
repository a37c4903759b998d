//! Task handles, lifecycle state and the explicit execution context.
//!
//! A [`TaskHandle`] is the identity every primitive in this crate works with:
//! the permit semaphore queues handles, blocking conditions park them and the
//! job manager drives their [`JobState`]. Each handle owns one mutex and one
//! condition variable; every blocking wait performed on behalf of the task
//! (permit acquisition, blocking-condition waits, interruptible sleeps) parks
//! on that pair, which is what lets a hard cancel wake the task wherever it
//! is parked.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::core::events::{JobEventKind, SharedEventSink};
use crate::core::semaphore::PermitSemaphore;
use crate::core::{JobError, JobResult};
use crate::util::clock::deadline_from;
use crate::util::ids::{next_task_id, TaskId};

/// Lifecycle state of a task future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, not yet handed to the manager.
    None,
    /// Submitted; first fire time not yet evaluated.
    Scheduled,
    /// Waiting for a fire time in the future.
    Pending,
    /// Task body is executing.
    Running,
    /// Due, but waiting for a permit of its permit group.
    WaitingForPermit,
    /// Task body is parked on a blocking condition.
    WaitingForBlockingCondition,
    /// The current round completed.
    Done,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Scheduled => "scheduled",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingForPermit => "waiting_for_permit",
            Self::WaitingForBlockingCondition => "waiting_for_blocking_condition",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// What a cancellation request found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The body had not started in the current round.
    NotStarted,
    /// The body is executing; it must still reach DONE on its own.
    Running,
    /// Already cancelled, finalizing or finished; nothing changed.
    AlreadyDone,
}

/// Result of parking on a task's condition variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Park {
    Ready,
    Interrupted,
    TimedOut,
}

/// Mutable per-task bookkeeping, guarded by the handle's mutex.
#[derive(Debug)]
pub(crate) struct ControlState {
    pub(crate) state: JobState,
    pub(crate) finished: bool,
    pub(crate) finalizing: bool,
    pub(crate) cancelled: bool,
    pub(crate) interrupted: bool,
    pub(crate) started: bool,
    pub(crate) next_execution: Option<Instant>,
    pub(crate) single_execution: bool,
    pub(crate) rounds_completed: u64,
    /// Ticket of the most recent permit grant delivered to this task.
    pub(crate) granted_ticket: Option<u64>,
    /// Ticket of the most recent blocking-condition release.
    pub(crate) signalled_ticket: Option<u64>,
    next_ticket: u64,
}

impl ControlState {
    const fn new() -> Self {
        Self {
            state: JobState::None,
            finished: false,
            finalizing: false,
            cancelled: false,
            interrupted: false,
            started: false,
            next_execution: None,
            single_execution: false,
            rounds_completed: 0,
            granted_ticket: None,
            signalled_ticket: None,
            next_ticket: 0,
        }
    }

    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }
}

/// Static description of a task, fixed at creation.
pub(crate) struct TaskSpec {
    pub(crate) name: String,
    pub(crate) permit_group: Option<Arc<PermitSemaphore>>,
    pub(crate) interrupt_on_cancel: bool,
    pub(crate) thread_name_hint: Option<String>,
    pub(crate) events: Option<SharedEventSink>,
}

struct TaskControl {
    id: TaskId,
    correlation_id: Uuid,
    spec: TaskSpec,
    state: Mutex<ControlState>,
    changed: Condvar,
}

/// Shared identity and control block of one submitted task.
///
/// Handles are cheap to clone; clones compare equal.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskControl>,
}

impl TaskHandle {
    /// Create a standalone handle, for using the primitives without a manager.
    pub fn new(name: impl Into<String>, permit_group: Option<Arc<PermitSemaphore>>) -> Self {
        Self::from_spec(TaskSpec {
            name: name.into(),
            permit_group,
            interrupt_on_cancel: false,
            thread_name_hint: None,
            events: None,
        })
    }

    pub(crate) fn from_spec(spec: TaskSpec) -> Self {
        Self {
            inner: Arc::new(TaskControl {
                id: next_task_id(),
                correlation_id: Uuid::new_v4(),
                spec,
                state: Mutex::new(ControlState::new()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Process-unique task id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Random correlation id, stable for the handle's lifetime.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.inner.correlation_id
    }

    /// Task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    /// Permit group this task competes in, if any.
    #[must_use]
    pub fn permit_group(&self) -> Option<&Arc<PermitSemaphore>> {
        self.inner.spec.permit_group.as_ref()
    }

    /// Whether bulk cancellation should interrupt this task.
    #[must_use]
    pub fn interrupt_on_cancel(&self) -> bool {
        self.inner.spec.interrupt_on_cancel
    }

    /// Preferred worker thread name.
    #[must_use]
    pub fn thread_name_hint(&self) -> Option<&str> {
        self.inner.spec.thread_name_hint.as_deref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.inner.state.lock().state
    }

    /// True once no further execution will ever occur.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().finished
    }

    /// True once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// True once a hard cancellation interrupted this task.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.state.lock().interrupted
    }

    /// Next scheduled fire time while more rounds are planned.
    #[must_use]
    pub fn next_execution(&self) -> Option<Instant> {
        self.inner.state.lock().next_execution
    }

    /// True if the task has exactly one scheduled run.
    #[must_use]
    pub fn is_single_execution(&self) -> bool {
        self.inner.state.lock().single_execution
    }

    /// Number of times this task reached DONE.
    #[must_use]
    pub fn rounds_completed(&self) -> u64 {
        self.inner.state.lock().rounds_completed
    }

    /// Deliver an interruption, waking any wait parked on behalf of this task.
    pub fn interrupt(&self) {
        let mut st = self.inner.state.lock();
        st.interrupted = true;
        self.inner.changed.notify_all();
        drop(st);
        debug!(task_id = self.id(), task = %self.name(), "task interrupted");
    }

    /// Request cancellation; `interrupt` additionally delivers an interruption.
    pub fn cancel(&self, interrupt: bool) -> CancelOutcome {
        let mut st = self.inner.state.lock();
        if interrupt {
            st.interrupted = true;
        }
        let outcome = if st.finished || st.finalizing || st.cancelled {
            CancelOutcome::AlreadyDone
        } else {
            st.cancelled = true;
            if st.started {
                CancelOutcome::Running
            } else {
                CancelOutcome::NotStarted
            }
        };
        self.inner.changed.notify_all();
        drop(st);
        if outcome != CancelOutcome::AlreadyDone {
            self.emit(JobEventKind::Cancelled { interrupt });
        }
        outcome
    }

    /// Block until the current round reaches DONE.
    ///
    /// Returns immediately if the task is DONE already. Rounds that complete
    /// while waiting are observed even if the task is re-armed right away.
    ///
    /// # Errors
    ///
    /// `JobError::Timeout` if `timeout` elapses first.
    pub fn await_done(&self, timeout: Option<Duration>) -> JobResult<()> {
        let baseline = self.inner.state.lock().rounds_completed;
        let outcome = self.park_until(deadline_from(timeout), false, |st| {
            st.state == JobState::Done || st.rounds_completed > baseline
        });
        Self::timed(outcome, timeout)
    }

    /// Block until the task is finished.
    ///
    /// # Errors
    ///
    /// `JobError::Timeout` if `timeout` elapses first.
    pub fn await_finished(&self, timeout: Option<Duration>) -> JobResult<()> {
        let outcome = self.park_until(deadline_from(timeout), false, |st| st.finished);
        Self::timed(outcome, timeout)
    }

    /// Interruptible sleep on behalf of this task.
    ///
    /// # Errors
    ///
    /// `JobError::Interrupted` if a hard cancel arrives while sleeping.
    pub fn sleep(&self, duration: Duration) -> JobResult<()> {
        match self.park_until(deadline_from(Some(duration)), true, |_| false) {
            Park::Interrupted => Err(JobError::Interrupted),
            Park::Ready | Park::TimedOut => Ok(()),
        }
    }

    fn timed(outcome: Park, timeout: Option<Duration>) -> JobResult<()> {
        match outcome {
            Park::Ready => Ok(()),
            Park::Interrupted => Err(JobError::Interrupted),
            Park::TimedOut => Err(JobError::Timeout(timeout.unwrap_or_default())),
        }
    }

    /// Park the calling thread on this task's condition variable until
    /// `ready` holds, the task is interrupted (if `interruptible`), or the
    /// deadline passes. Interruption is checked before readiness.
    pub(crate) fn park_until<F>(&self, deadline: Option<Instant>, interruptible: bool, mut ready: F) -> Park
    where
        F: FnMut(&mut ControlState) -> bool,
    {
        let mut st = self.inner.state.lock();
        loop {
            if interruptible && st.interrupted {
                return Park::Interrupted;
            }
            if ready(&mut st) {
                return Park::Ready;
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Park::TimedOut;
                    }
                    self.inner.changed.wait_until(&mut st, deadline);
                }
                None => self.inner.changed.wait(&mut st),
            }
        }
    }

    pub(crate) fn set_state(&self, to: JobState) {
        let mut st = self.inner.state.lock();
        let from = st.state;
        st.state = to;
        self.inner.changed.notify_all();
        drop(st);
        if from != to {
            self.emit(JobEventKind::StateChanged { from, to });
        }
    }

    pub(crate) fn set_single_execution(&self, single: bool) {
        self.inner.state.lock().single_execution = single;
    }

    /// Move to `to` unless cancellation or finalization got there first.
    pub(crate) fn advance(&self, to: JobState) -> bool {
        self.advance_with(to, |_| {})
    }

    /// Arm the task for a future fire time; false once cancelled.
    pub(crate) fn set_pending(&self, at: Instant) -> bool {
        self.advance_with(JobState::Pending, |st| st.next_execution = Some(at))
    }

    fn advance_with<F>(&self, to: JobState, update: F) -> bool
    where
        F: FnOnce(&mut ControlState),
    {
        let mut st = self.inner.state.lock();
        if st.cancelled || st.finalizing || st.finished {
            return false;
        }
        let from = st.state;
        st.state = to;
        update(&mut st);
        self.inner.changed.notify_all();
        drop(st);
        if from != to {
            self.emit(JobEventKind::StateChanged { from, to });
        }
        true
    }

    /// Mark the task as queued for a permit, unless round `round` already
    /// started or the task was cancelled.
    pub(crate) fn mark_waiting_for_permit(&self, round: u64) {
        let mut st = self.inner.state.lock();
        if st.cancelled || st.finalizing || st.finished || st.started || st.rounds_completed != round {
            return;
        }
        let from = st.state;
        st.state = JobState::WaitingForPermit;
        self.inner.changed.notify_all();
        drop(st);
        if from != JobState::WaitingForPermit {
            self.emit(JobEventKind::StateChanged {
                from,
                to: JobState::WaitingForPermit,
            });
        }
    }

    /// Claim the current round for execution. Fails once cancelled.
    pub(crate) fn try_start(&self) -> bool {
        let mut st = self.inner.state.lock();
        if st.cancelled || st.finalizing || st.finished {
            return false;
        }
        let from = st.state;
        st.started = true;
        st.state = JobState::Running;
        st.next_execution = None;
        self.inner.changed.notify_all();
        drop(st);
        self.emit(JobEventKind::StateChanged { from, to: JobState::Running });
        true
    }

    /// End a round that will be followed by another one at `next`.
    ///
    /// Passes through DONE so `await_done` callers see the round, then
    /// re-arms as PENDING. Returns false if the task was cancelled meanwhile.
    pub(crate) fn complete_round(&self, next: Instant) -> bool {
        let mut st = self.inner.state.lock();
        if st.cancelled {
            return false;
        }
        let from = st.state;
        st.started = false;
        st.rounds_completed += 1;
        st.state = JobState::Pending;
        st.next_execution = Some(next);
        self.inner.changed.notify_all();
        drop(st);
        self.emit(JobEventKind::StateChanged { from, to: JobState::Done });
        self.emit(JobEventKind::StateChanged { from: JobState::Done, to: JobState::Pending });
        true
    }

    /// Claim finalization; only the first caller wins.
    pub(crate) fn begin_finalize(&self) -> bool {
        let mut st = self.inner.state.lock();
        if st.finalizing || st.finished {
            return false;
        }
        st.finalizing = true;
        true
    }

    pub(crate) fn mark_done(&self) {
        let mut st = self.inner.state.lock();
        let from = st.state;
        st.started = false;
        st.state = JobState::Done;
        st.next_execution = None;
        st.rounds_completed += 1;
        self.inner.changed.notify_all();
        drop(st);
        if from != JobState::Done {
            self.emit(JobEventKind::StateChanged { from, to: JobState::Done });
        }
    }

    pub(crate) fn mark_finished(&self) {
        let mut st = self.inner.state.lock();
        debug_assert_eq!(st.state, JobState::Done);
        st.finished = true;
        self.inner.changed.notify_all();
        drop(st);
        self.emit(JobEventKind::Finished);
    }

    /// Reserve a ticket identifying one permit request.
    pub(crate) fn begin_acquire(&self) -> u64 {
        self.inner.state.lock().issue_ticket()
    }

    /// Deliver a permit grant for `ticket` and wake the requester.
    pub(crate) fn grant_permit(&self, ticket: u64) {
        let mut st = self.inner.state.lock();
        st.granted_ticket = Some(ticket);
        self.inner.changed.notify_all();
    }

    /// Reserve a ticket identifying one blocking-condition wait.
    pub(crate) fn begin_condition_wait(&self) -> u64 {
        self.inner.state.lock().issue_ticket()
    }

    /// Release the blocking-condition wait identified by `ticket`.
    pub(crate) fn signal_condition(&self, ticket: u64) {
        let mut st = self.inner.state.lock();
        st.signalled_ticket = Some(ticket);
        self.inner.changed.notify_all();
    }

    pub(crate) fn emit(&self, kind: JobEventKind) {
        if let Some(sink) = &self.inner.spec.events {
            sink.record(crate::core::events::build_job_event(self.id(), self.name(), kind));
        }
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.spec.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Explicit execution context handed to a task body.
///
/// Replaces ambient "current task" lookups: everything a body needs to
/// cooperate with the scheduler is reachable from here.
#[derive(Debug, Clone)]
pub struct JobContext {
    task: TaskHandle,
    round: u64,
    fire_time: Instant,
}

impl JobContext {
    pub(crate) const fn new(task: TaskHandle, round: u64, fire_time: Instant) -> Self {
        Self { task, round, fire_time }
    }

    /// Context for a task running outside the manager.
    #[must_use]
    pub fn for_task(task: TaskHandle) -> Self {
        Self::new(task, 1, Instant::now())
    }

    /// The running task.
    #[must_use]
    pub const fn task(&self) -> &TaskHandle {
        &self.task
    }

    /// One-based round number.
    #[must_use]
    pub const fn round(&self) -> u64 {
        self.round
    }

    /// The fire time this round was scheduled for.
    #[must_use]
    pub const fn fire_time(&self) -> Instant {
        self.fire_time
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// Whether a hard cancel interrupted the task.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.task.is_interrupted()
    }

    /// Fail fast if interrupted.
    ///
    /// # Errors
    ///
    /// `JobError::Interrupted` once a hard cancel was delivered.
    pub fn check_interrupted(&self) -> JobResult<()> {
        if self.is_interrupted() {
            Err(JobError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleep, waking early on interruption.
    ///
    /// # Errors
    ///
    /// `JobError::Interrupted` if interrupted while sleeping.
    pub fn sleep(&self, duration: Duration) -> JobResult<()> {
        self.task.sleep(duration)
    }
}
