//! Blocking condition: cooperative suspension of a running task.
//!
//! A task parking on an armed condition gives its permit back first so that
//! other competitors can run, and takes a permit again, at the head of the
//! queue, before its body resumes. Release and re-acquisition are two
//! explicit steps around the park; the condition's lock is never held while
//! calling into the semaphore.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::core::semaphore::QueuePosition;
use crate::core::task::{JobContext, JobState, Park, TaskHandle};
use crate::core::{JobError, JobResult};
use crate::util::clock::deadline_from;

struct ConditionState {
    blocking: bool,
    /// Parked tasks with the ticket of their wait.
    waiters: Vec<(TaskHandle, u64)>,
}

/// Park/resume signal for running tasks.
pub struct BlockingCondition {
    name: String,
    state: Mutex<ConditionState>,
}

impl BlockingCondition {
    /// Create a condition, armed if `blocking` is true.
    pub fn new(name: impl Into<String>, blocking: bool) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ConditionState {
                blocking,
                waiters: Vec::new(),
            }),
        }
    }

    /// Condition name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether waiters currently park.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.state.lock().blocking
    }

    /// Number of parked tasks.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Arm or disarm the condition.
    ///
    /// Disarming releases every parked task; each then re-acquires its
    /// permit on its own thread. While disarmed, waits pass straight through.
    pub fn set_blocking(&self, blocking: bool) {
        let released = {
            let mut st = self.state.lock();
            st.blocking = blocking;
            if blocking {
                Vec::new()
            } else {
                std::mem::take(&mut st.waiters)
            }
        };
        info!(condition = %self.name, blocking, released = released.len(), "blocking condition changed");
        for (task, ticket) in released {
            task.signal_condition(ticket);
        }
    }

    /// Park the task running in `cx` until the condition is disarmed.
    ///
    /// # Errors
    ///
    /// See [`BlockingCondition::wait_task`].
    pub fn wait_for(&self, cx: &JobContext, timeout: Option<Duration>) -> JobResult<()> {
        self.wait_task(cx.task(), timeout)
    }

    /// Park `task` until the condition is disarmed.
    ///
    /// A permit held by the task is released before parking and re-acquired
    /// with [`QueuePosition::Head`] before returning, also when the timeout
    /// elapsed.
    ///
    /// # Errors
    ///
    /// - `JobError::Timeout` if `timeout` elapsed before the condition was
    ///   disarmed (the permit has been re-acquired).
    /// - `JobError::Interrupted` on hard cancellation; the permit is not
    ///   re-acquired.
    pub fn wait_task(&self, task: &TaskHandle, timeout: Option<Duration>) -> JobResult<()> {
        if task.is_interrupted() {
            return Err(JobError::Interrupted);
        }
        let ticket = task.begin_condition_wait();
        {
            let mut st = self.state.lock();
            if !st.blocking {
                return Ok(());
            }
            st.waiters.push((task.clone(), ticket));
        }

        let resume_state = task.state();
        let held = task.permit_group().filter(|group| group.is_owner(task)).cloned();
        task.set_state(JobState::WaitingForBlockingCondition);
        if let Some(group) = &held {
            if let Err(err) = group.release(task) {
                self.remove_waiter(task);
                task.set_state(resume_state);
                return Err(err);
            }
        }
        debug!(
            condition = %self.name,
            task_id = task.id(),
            released_permit = held.is_some(),
            "task parked on blocking condition"
        );

        let outcome = task.park_until(deadline_from(timeout), true, |st| st.signalled_ticket == Some(ticket));
        self.remove_waiter(task);

        if outcome == Park::Interrupted {
            task.set_state(resume_state);
            debug!(condition = %self.name, task_id = task.id(), "blocking wait interrupted");
            return Err(JobError::Interrupted);
        }

        if let Some(group) = held {
            task.set_state(JobState::WaitingForPermit);
            if let Err(err) = group.acquire(task, QueuePosition::Head, None) {
                task.set_state(resume_state);
                return Err(err);
            }
        }
        task.set_state(resume_state);
        debug!(condition = %self.name, task_id = task.id(), "task resumed from blocking condition");

        match outcome {
            Park::TimedOut => Err(JobError::Timeout(timeout.unwrap_or_default())),
            Park::Ready | Park::Interrupted => Ok(()),
        }
    }

    fn remove_waiter(&self, task: &TaskHandle) {
        self.state.lock().waiters.retain(|(waiter, _)| waiter != task);
    }
}

impl std::fmt::Debug for BlockingCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("BlockingCondition")
            .field("name", &self.name)
            .field("blocking", &st.blocking)
            .field("waiters", &st.waiters.len())
            .finish()
    }
}
