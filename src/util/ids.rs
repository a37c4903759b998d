//! Task id generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique task identifier.
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next task id. Ids start at 1 and are never reused.
pub fn next_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}
