//! Tests for error types

use prometheus_job_manager::core::{JobError, UsageError};
use std::time::Duration;

#[test]
fn test_usage_error_display() {
    let err = UsageError::NotOwner {
        task: "report".into(),
        group: "gpu".into(),
    };
    assert_eq!(err.to_string(), "task `report` does not own a permit of `gpu`");
}

#[test]
fn test_usage_error_converts_into_job_error() {
    let err: JobError = UsageError::Sealed("gpu".into()).into();
    assert!(err.is_usage());
    assert_eq!(err.to_string(), "usage error: permit group `gpu` is sealed");
}

#[test]
fn test_job_error_kinds() {
    assert!(JobError::Timeout(Duration::from_millis(5)).is_timeout());
    assert!(JobError::Interrupted.is_interrupted());
    assert!(!JobError::Cancelled.is_timeout());
    assert_eq!(JobError::PoolShutdown.to_string(), "worker pool has been shut down");
}

#[test]
fn test_task_failure_round_trips_through_anyhow() {
    let failed = JobError::task_failed(anyhow::anyhow!("disk full"));
    assert_eq!(failed.to_string(), "task failed: disk full");

    let wrapped: anyhow::Error = JobError::Cancelled.into();
    assert!(matches!(wrapped.downcast::<JobError>(), Ok(JobError::Cancelled)));
}
