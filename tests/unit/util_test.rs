//! Tests for utility functions

use prometheus_job_manager::util::{deadline_from, next_task_id, now_ms, TaskId};
use std::time::{Duration, Instant};

#[test]
fn test_task_ids_increase() {
    let first: TaskId = next_task_id();
    let second = next_task_id();
    assert!(first >= 1);
    assert!(second > first);
}

#[test]
fn test_deadline_from_timeout() {
    assert!(deadline_from(None).is_none());
    let before = Instant::now();
    let deadline = deadline_from(Some(Duration::from_secs(1))).unwrap();
    assert!(deadline >= before + Duration::from_secs(1));
}

#[test]
fn test_now_ms_is_after_epoch() {
    assert!(now_ms() > 0);
}
