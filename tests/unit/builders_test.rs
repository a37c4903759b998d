//! Tests for builder modules

use prometheus_job_manager::builders::{build_worker_pool, JobManagerBuilder};
use prometheus_job_manager::config::{JobManagerConfig, WorkerPoolConfig, WorkerPoolKind};
use prometheus_job_manager::core::JobError;

#[test]
fn test_builder_defaults() {
    let manager = JobManagerBuilder::new().build().unwrap();
    assert!(manager.is_accepting());
    assert_eq!(manager.registered_count(), 0);
    assert_eq!(manager.config(), &JobManagerConfig::default());
}

#[test]
fn test_builder_rejects_invalid_config() {
    let config = JobManagerConfig {
        shutdown_timeout_ms: 0,
        ..JobManagerConfig::default()
    };
    let err = JobManagerBuilder::from_config(config).build().unwrap_err();
    assert!(matches!(err, JobError::InvalidConfig(_)));
}

#[test]
fn test_build_fixed_worker_pool() {
    let cfg = WorkerPoolConfig::new().with_kind(WorkerPoolKind::Fixed).with_worker_count(3);
    let pool = build_worker_pool(&cfg, "unit").unwrap();
    assert_eq!(pool.stats().worker_count, 3);
    pool.shutdown();
}

#[test]
fn test_build_tokio_pool_outside_runtime_fails() {
    let cfg = WorkerPoolConfig::new().with_kind(WorkerPoolKind::Tokio);
    let err = build_worker_pool(&cfg, "unit").err().expect("expected build_worker_pool to fail");
    assert!(matches!(err, JobError::InvalidConfig(_)));
}
