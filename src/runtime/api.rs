//! API-facing snapshot models.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{JobState, TaskHandle};
use crate::util::ids::TaskId;

/// Point-in-time view of one registered task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Task identifier.
    pub task_id: TaskId,
    /// Task name.
    pub task_name: String,
    /// Correlation id for log search.
    pub correlation_id: Uuid,
    /// Lifecycle state.
    pub state: JobState,
    /// Cancellation requested.
    pub cancelled: bool,
    /// Exactly one scheduled run.
    pub single_execution: bool,
    /// Rounds completed so far.
    pub rounds_completed: u64,
    /// Milliseconds until the next fire time, zero if overdue.
    pub next_execution_in_ms: Option<u128>,
    /// Permit group name.
    pub permit_group: Option<String>,
}

impl JobSnapshot {
    /// Capture the current state of `task`.
    #[must_use]
    pub fn from_handle(task: &TaskHandle) -> Self {
        Self {
            task_id: task.id(),
            task_name: task.name().to_string(),
            correlation_id: task.correlation_id(),
            state: task.state(),
            cancelled: task.is_cancelled(),
            single_execution: task.is_single_execution(),
            rounds_completed: task.rounds_completed(),
            next_execution_in_ms: task
                .next_execution()
                .map(|at| at.saturating_duration_since(std::time::Instant::now()).as_millis()),
            permit_group: task.permit_group().map(|g| g.name().to_string()),
        }
    }
}

/// Health payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Registered tasks.
    pub registered: usize,
}

/// Health of a manager: healthy while it accepts submissions.
pub fn health(manager: &crate::core::JobManager) -> Health {
    Health {
        ok: manager.is_accepting(),
        registered: manager.registered_count(),
    }
}
