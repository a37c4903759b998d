//! Permit semaphore: a re-configurable counting semaphore with a fair
//! competitor queue.
//!
//! Competitors are [`TaskHandle`]s that declared this semaphore as their
//! permit group. The queue is FIFO for [`QueuePosition::Tail`] insertions;
//! [`QueuePosition::Head`] insertions jump ahead of every tail entry but stay
//! FIFO among themselves, which lets a task that parked on a blocking
//! condition resume ahead of newly arrived work.
//!
//! Acquired-callbacks are collected while the internal lock is held and
//! invoked only after it has been released. A callback typically wakes a
//! thread that immediately calls back into the semaphore, so invoking it
//! under the lock would deadlock.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::core::task::{Park, TaskHandle};
use crate::core::{JobError, JobResult, UsageError};
use crate::util::clock::deadline_from;
use crate::util::ids::TaskId;

/// Where a new competitor is inserted relative to existing waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePosition {
    /// Ahead of all tail entries, behind earlier head entries.
    Head,
    /// Behind every waiting competitor.
    #[default]
    Tail,
}

/// What [`PermitSemaphore::withdraw`] found for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Withdrawal {
    /// The task was queued and has been removed.
    Removed,
    /// The task already owns a permit; nothing was removed.
    Owner,
    /// The task is neither queued nor an owner.
    Absent,
}

type AcquiredCallback = Box<dyn FnOnce() + Send + 'static>;

struct Competitor {
    task: TaskHandle,
    position: QueuePosition,
    on_acquired: AcquiredCallback,
}

struct SemaphoreState {
    permits: usize,
    sealed: bool,
    owners: HashSet<TaskId>,
    competitors: VecDeque<Competitor>,
}

impl SemaphoreState {
    fn has_free_permit(&self) -> bool {
        self.owners.len() < self.permits
    }

    fn is_queued(&self, id: TaskId) -> bool {
        self.competitors.iter().any(|c| c.task.id() == id)
    }

    fn insert(&mut self, competitor: Competitor) {
        match competitor.position {
            QueuePosition::Tail => self.competitors.push_back(competitor),
            QueuePosition::Head => {
                let index = self
                    .competitors
                    .iter()
                    .position(|c| c.position == QueuePosition::Tail)
                    .unwrap_or(self.competitors.len());
                self.competitors.insert(index, competitor);
            }
        }
    }

    /// Move head-of-queue competitors to owners while capacity allows.
    fn grant_queued(&mut self) -> Vec<(TaskId, AcquiredCallback)> {
        let mut granted = Vec::new();
        while self.has_free_permit() {
            let Some(next) = self.competitors.pop_front() else {
                break;
            };
            self.owners.insert(next.task.id());
            granted.push((next.task.id(), next.on_acquired));
        }
        granted
    }
}

/// Counting semaphore with FIFO/HEAD competitor queue and adjustable capacity.
pub struct PermitSemaphore {
    name: String,
    state: Mutex<SemaphoreState>,
}

impl PermitSemaphore {
    /// Create a semaphore with `permits` initial capacity.
    pub fn new(name: impl Into<String>, permits: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(SemaphoreState {
                permits,
                sealed: false,
                owners: HashSet::new(),
                competitors: VecDeque::new(),
            }),
        })
    }

    /// Semaphore name, used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured capacity.
    #[must_use]
    pub fn permits(&self) -> usize {
        self.state.lock().permits
    }

    /// Permits not currently owned. Zero while capacity is below ownership.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        let st = self.state.lock();
        st.permits.saturating_sub(st.owners.len())
    }

    /// Number of tasks currently holding a permit.
    #[must_use]
    pub fn owner_count(&self) -> usize {
        self.state.lock().owners.len()
    }

    /// Number of tasks waiting in the queue.
    #[must_use]
    pub fn competitor_count(&self) -> usize {
        self.state.lock().competitors.len()
    }

    /// Whether `task` currently owns a permit.
    #[must_use]
    pub fn is_owner(&self, task: &TaskHandle) -> bool {
        self.state.lock().owners.contains(&task.id())
    }

    /// Whether `task` is waiting in the queue.
    #[must_use]
    pub fn is_competing(&self, task: &TaskHandle) -> bool {
        self.state.lock().is_queued(task.id())
    }

    /// Whether capacity changes are rejected.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    /// Reject all further capacity changes.
    pub fn seal(&self) {
        self.state.lock().sealed = true;
        info!(group = %self.name, "permit group sealed");
    }

    /// Change the capacity.
    ///
    /// Raising the capacity grants newly available permits to queued
    /// competitors in queue order before returning. Lowering it only
    /// throttles future grants; current owners keep their permits.
    ///
    /// # Errors
    ///
    /// `UsageError::Sealed` if the semaphore is sealed.
    pub fn with_permits(&self, permits: usize) -> JobResult<()> {
        let (previous, granted) = {
            let mut st = self.state.lock();
            if st.sealed {
                return Err(UsageError::Sealed(self.name.clone()).into());
            }
            let previous = std::mem::replace(&mut st.permits, permits);
            (previous, st.grant_queued())
        };
        info!(
            group = %self.name,
            previous,
            permits,
            granted = granted.len(),
            "permit capacity changed"
        );
        self.notify(granted);
        Ok(())
    }

    /// Compete for a permit without blocking.
    ///
    /// Returns `true` and runs `on_acquired` on the calling thread if a
    /// permit was free and nobody was queued. Otherwise the task is queued
    /// at `position`, `false` is returned, and `on_acquired` runs later on
    /// whichever thread frees a permit for it.
    ///
    /// # Errors
    ///
    /// Usage error if the task does not belong to this permit group or is
    /// already competing.
    pub fn compete<F>(&self, task: &TaskHandle, position: QueuePosition, on_acquired: F) -> JobResult<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.enqueue_or_grant(task, position, Box::new(on_acquired))? {
            Some(callback) => {
                callback();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Block until `task` owns a permit.
    ///
    /// # Errors
    ///
    /// - Usage error if the task does not belong to this permit group.
    /// - `JobError::Interrupted` if the task is hard-cancelled while waiting;
    ///   the task is removed from the queue.
    /// - `JobError::Timeout` if `timeout` elapses; the task is removed from
    ///   the queue.
    pub fn acquire(&self, task: &TaskHandle, position: QueuePosition, timeout: Option<Duration>) -> JobResult<()> {
        if task.is_interrupted() {
            self.check_member(task)?;
            return Err(JobError::Interrupted);
        }
        let ticket = task.begin_acquire();
        let waker = task.clone();
        let granted_now = self.enqueue_or_grant(task, position, Box::new(move || waker.grant_permit(ticket)))?;
        if granted_now.is_some() {
            return Ok(());
        }

        debug!(group = %self.name, task_id = task.id(), task = %task.name(), "parked waiting for permit");
        let outcome = task.park_until(deadline_from(timeout), true, |st| st.granted_ticket == Some(ticket));
        match outcome {
            Park::Ready => Ok(()),
            Park::Interrupted => {
                self.abandon(task);
                debug!(group = %self.name, task_id = task.id(), "permit wait interrupted");
                Err(JobError::Interrupted)
            }
            Park::TimedOut => {
                self.abandon(task);
                Err(JobError::Timeout(timeout.unwrap_or_default()))
            }
        }
    }

    /// Give back the permit owned by `task` and hand freed permits to the
    /// head of the queue.
    ///
    /// # Errors
    ///
    /// `UsageError::NotOwner` if `task` does not own a permit; ownership is
    /// left unchanged.
    pub fn release(&self, task: &TaskHandle) -> JobResult<()> {
        let granted = {
            let mut st = self.state.lock();
            if !st.owners.remove(&task.id()) {
                return Err(UsageError::NotOwner {
                    task: task.name().to_string(),
                    group: self.name.clone(),
                }
                .into());
            }
            st.grant_queued()
        };
        debug!(
            group = %self.name,
            task_id = task.id(),
            handed_over = granted.len(),
            "permit released"
        );
        self.notify(granted);
        Ok(())
    }

    /// Remove `task` from the competitor queue.
    pub fn withdraw(&self, task: &TaskHandle) -> Withdrawal {
        let mut st = self.state.lock();
        if let Some(index) = st.competitors.iter().position(|c| c.task.id() == task.id()) {
            st.competitors.remove(index);
            trace!(group = %self.name, task_id = task.id(), "competitor withdrawn");
            Withdrawal::Removed
        } else if st.owners.contains(&task.id()) {
            Withdrawal::Owner
        } else {
            Withdrawal::Absent
        }
    }

    /// Withdraw after a failed wait; a permit granted in the meantime is
    /// passed on rather than kept.
    fn abandon(&self, task: &TaskHandle) {
        if self.withdraw(task) == Withdrawal::Owner {
            if let Err(err) = self.release(task) {
                warn!(group = %self.name, task_id = task.id(), error = %err, "could not pass on abandoned permit");
            }
        }
    }

    fn check_member(&self, task: &TaskHandle) -> JobResult<()> {
        match task.permit_group() {
            None => Err(UsageError::NoPermitGroup(task.name().to_string()).into()),
            Some(group) if std::ptr::eq(Arc::as_ptr(group), self) => Ok(()),
            Some(_) => Err(UsageError::ForeignPermitGroup {
                task: task.name().to_string(),
                group: self.name.clone(),
            }
            .into()),
        }
    }

    /// Grant immediately (returning the callback for the caller to run) or
    /// queue the competitor.
    fn enqueue_or_grant(
        &self,
        task: &TaskHandle,
        position: QueuePosition,
        on_acquired: AcquiredCallback,
    ) -> JobResult<Option<AcquiredCallback>> {
        self.check_member(task)?;
        let mut st = self.state.lock();
        if st.owners.contains(&task.id()) || st.is_queued(task.id()) {
            return Err(UsageError::AlreadyCompeting(task.name().to_string()).into());
        }
        if st.has_free_permit() && st.competitors.is_empty() {
            st.owners.insert(task.id());
            let owners = st.owners.len();
            drop(st);
            debug!(group = %self.name, task_id = task.id(), owners, "permit granted immediately");
            return Ok(Some(on_acquired));
        }
        st.insert(Competitor {
            task: task.clone(),
            position,
            on_acquired,
        });
        let queued = st.competitors.len();
        drop(st);
        debug!(group = %self.name, task_id = task.id(), ?position, queued, "competitor queued");
        Ok(None)
    }

    /// Run acquired-callbacks; never called with the state lock held.
    fn notify(&self, granted: Vec<(TaskId, AcquiredCallback)>) {
        for (task_id, callback) in granted {
            trace!(group = %self.name, task_id, "notifying permit owner");
            callback();
        }
    }
}

impl fmt::Debug for PermitSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("PermitSemaphore")
            .field("name", &self.name)
            .field("permits", &st.permits)
            .field("owners", &st.owners.len())
            .field("competitors", &st.competitors.len())
            .field("sealed", &st.sealed)
            .finish()
    }
}
