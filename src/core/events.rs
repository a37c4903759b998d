//! Lifecycle event sinks.
//!
//! The manager reports submissions, state transitions, permit handovers,
//! cancellations and finalization to an optional [`JobEventSink`]. Sinks are
//! called on whichever thread caused the event and must not block.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::task::JobState;
use crate::util::clock::now_ms;
use crate::util::ids::TaskId;

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEventKind {
    /// Accepted by the manager.
    Submitted,
    /// Lifecycle state transition.
    StateChanged {
        /// State before the transition.
        from: JobState,
        /// State after the transition.
        to: JobState,
    },
    /// A permit of the task's permit group was granted.
    PermitAcquired,
    /// The task gave its permit back.
    PermitReleased,
    /// Cancellation was requested.
    Cancelled {
        /// Whether the cancellation interrupted the task.
        interrupt: bool,
    },
    /// No further execution will occur.
    Finished,
}

/// Lifecycle event record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Task identifier.
    pub task_id: TaskId,
    /// Task name.
    pub task_name: String,
    /// What happened.
    pub kind: JobEventKind,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
}

/// Receiver of lifecycle events.
pub trait JobEventSink: Send + Sync {
    /// Record an event.
    fn record(&self, event: JobEvent);
}

/// Shared, type-erased event sink.
pub type SharedEventSink = Arc<dyn JobEventSink>;

/// In-memory sink with a bounded buffer, for tests and dev.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<JobEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a sink keeping at most `max_events`; the oldest are dropped first.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Snapshot of stored events, oldest first.
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Stored events of one task, oldest first.
    pub fn events_for(&self, task_id: TaskId) -> Vec<JobEventKind> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id == task_id)
            .map(|e| e.kind)
            .collect()
    }
}

impl JobEventSink for InMemoryEventSink {
    fn record(&self, event: JobEvent) {
        if self.max_events == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

impl std::fmt::Debug for InMemoryEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventSink")
            .field("stored", &self.events.lock().len())
            .field("max_events", &self.max_events)
            .finish()
    }
}

/// Helper to build an event stamped with the current time.
pub fn build_job_event(task_id: TaskId, task_name: impl Into<String>, kind: JobEventKind) -> JobEvent {
    JobEvent {
        task_id,
        task_name: task_name.into(),
        kind,
        created_at_ms: now_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_drops_oldest_when_full() {
        let sink = InMemoryEventSink::new(2);
        sink.record(build_job_event(1, "a", JobEventKind::Submitted));
        sink.record(build_job_event(1, "a", JobEventKind::PermitAcquired));
        sink.record(build_job_event(1, "a", JobEventKind::Finished));
        assert_eq!(sink.events_for(1), vec![JobEventKind::PermitAcquired, JobEventKind::Finished]);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = build_job_event(
            7,
            "report",
            JobEventKind::StateChanged {
                from: JobState::Pending,
                to: JobState::Running,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["kind"], "state_changed");
        assert_eq!(json["kind"]["to"], "running");
        assert_eq!(json["task_name"], "report");
    }
}
