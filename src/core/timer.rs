//! Fire-time ordered dispatch thread.
//!
//! A single thread owns a min-heap of pending fire times and sleeps on a
//! condition variable until the earliest one is due or a new, earlier entry
//! arrives. Due entries are fired with the heap lock released. Entries hold
//! weak references, so a job that finished while pending is skipped.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace};

use crate::core::manager::ScheduledJob;
use crate::core::{JobError, JobResult};

struct TimerEntry {
    at: Instant,
    seq: u64,
    job: Weak<dyn ScheduledJob>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: earliest fire time, then earliest
        // insertion, must compare greatest.
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

pub(crate) struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub(crate) fn start(thread_name: String) -> JobResult<Self> {
        let shared = Arc::new(TimerShared::default());
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || timer_loop(&worker))
            .map_err(|e| JobError::Internal(format!("failed to spawn timer thread: {e}")))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue `job` to fire at `at`; no-op after shutdown.
    pub(crate) fn schedule(&self, at: Instant, job: Weak<dyn ScheduledJob>) {
        let mut st = self.shared.state.lock();
        if st.shutdown {
            return;
        }
        st.next_seq += 1;
        let seq = st.next_seq;
        let earliest = st.heap.peek().is_none_or(|head| at < head.at);
        st.heap.push(TimerEntry { at, seq, job });
        if earliest {
            self.shared.wake.notify_one();
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    /// Stop the thread without waiting for it.
    pub(crate) fn stop(&self) {
        let mut st = self.shared.state.lock();
        st.shutdown = true;
        st.heap.clear();
        self.shared.wake.notify_all();
    }

    /// Stop the thread and join it.
    pub(crate) fn shutdown(&self) {
        self.stop();
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            debug!("timer thread panicked");
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn timer_loop(shared: &TimerShared) {
    debug!("timer thread started");
    let mut st = shared.state.lock();
    loop {
        if st.shutdown {
            break;
        }
        let now = Instant::now();
        match st.heap.peek().map(|entry| entry.at) {
            None => shared.wake.wait(&mut st),
            Some(at) if at > now => {
                shared.wake.wait_until(&mut st, at);
            }
            Some(_) => {
                let due = drain_due(&mut st, now);
                MutexGuard::unlocked(&mut st, || fire_all(due));
            }
        }
    }
    info!("timer thread exiting");
}

fn drain_due(st: &mut TimerState, now: Instant) -> Vec<(Instant, Weak<dyn ScheduledJob>)> {
    let mut due = Vec::new();
    while st.heap.peek().is_some_and(|entry| entry.at <= now) {
        if let Some(entry) = st.heap.pop() {
            due.push((entry.at, entry.job));
        }
    }
    due
}

fn fire_all(due: Vec<(Instant, Weak<dyn ScheduledJob>)>) {
    for (at, job) in due {
        match job.upgrade() {
            Some(job) => {
                let task_id = job.handle().id();
                trace!(task_id, "fire time reached");
                if panic::catch_unwind(AssertUnwindSafe(|| job.fire(at))).is_err() {
                    error!(task_id, "dispatch panicked");
                }
            }
            None => trace!("skipping fire time of a released job"),
        }
    }
}
