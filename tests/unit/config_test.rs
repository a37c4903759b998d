//! Tests for configuration validation

use prometheus_job_manager::config::{JobManagerConfig, WorkerPoolConfig, WorkerPoolKind};
use prometheus_job_manager::core::QueuePosition;
use std::collections::HashMap;

#[test]
fn test_default_config_is_valid() {
    let config = JobManagerConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.worker_pool.kind, WorkerPoolKind::OnDemand);
    assert_eq!(config.default_queue_position, QueuePosition::Tail);
    assert!(config.worker_pool.worker_count > 0);
}

#[test]
fn test_worker_pool_config_invalid_worker_count() {
    let invalid = WorkerPoolConfig::new().with_worker_count(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_worker_pool_config_invalid_queue_depth() {
    let invalid = WorkerPoolConfig::new().with_max_queue_depth(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_worker_pool_config_invalid_stack_size() {
    let invalid = WorkerPoolConfig::new().with_thread_stack_size(1024);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_manager_config_invalid_prefix() {
    let invalid = JobManagerConfig {
        thread_name_prefix: "  ".into(),
        ..JobManagerConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_manager_config_invalid_shutdown_timeout() {
    let invalid = JobManagerConfig {
        shutdown_timeout_ms: 0,
        ..JobManagerConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_manager_config_rejects_invalid_pool() {
    let invalid = JobManagerConfig {
        worker_pool: WorkerPoolConfig::new().with_worker_count(0),
        ..JobManagerConfig::default()
    };
    let err = invalid.validate().unwrap_err();
    assert!(err.starts_with("worker_pool invalid"));
}

#[test]
fn test_from_json_str_fills_defaults() {
    let json = r#"{
        "worker_pool": { "kind": "fixed", "worker_count": 4 },
        "default_queue_position": "head"
    }"#;
    let config = JobManagerConfig::from_json_str(json).unwrap();
    assert_eq!(config.worker_pool.kind, WorkerPoolKind::Fixed);
    assert_eq!(config.worker_pool.worker_count, 4);
    assert_eq!(config.worker_pool.max_queue_depth, 1024);
    assert_eq!(config.default_queue_position, QueuePosition::Head);
    assert_eq!(config.thread_name_prefix, "job");
}

#[test]
fn test_from_json_str_rejects_invalid() {
    assert!(JobManagerConfig::from_json_str("{ not json").is_err());
    assert!(JobManagerConfig::from_json_str(r#"{ "shutdown_timeout_ms": 0 }"#).is_err());
}

#[test]
fn test_from_lookup_reads_variables() {
    let vars: HashMap<&str, &str> = [
        ("JOB_MANAGER_WORKER_POOL", "fixed"),
        ("JOB_MANAGER_WORKER_COUNT", "3"),
        ("JOB_MANAGER_QUEUE_POSITION", "HEAD"),
        ("JOB_MANAGER_THREAD_NAME_PREFIX", "batch"),
        ("JOB_MANAGER_SHUTDOWN_TIMEOUT_MS", "500"),
    ]
    .into_iter()
    .collect();
    let config = JobManagerConfig::from_lookup(|key| vars.get(key).map(|v| (*v).to_string())).unwrap();
    assert_eq!(config.worker_pool.kind, WorkerPoolKind::Fixed);
    assert_eq!(config.worker_pool.worker_count, 3);
    assert_eq!(config.default_queue_position, QueuePosition::Head);
    assert_eq!(config.thread_name_prefix, "batch");
    assert_eq!(config.shutdown_timeout_ms, 500);
}

#[test]
fn test_from_lookup_rejects_bad_values() {
    let err = JobManagerConfig::from_lookup(|key| (key == "JOB_MANAGER_WORKER_COUNT").then(|| "many".to_string()))
        .unwrap_err();
    assert!(err.starts_with("JOB_MANAGER_WORKER_COUNT"));
    assert!(JobManagerConfig::from_lookup(|key| (key == "JOB_MANAGER_WORKER_POOL").then(|| "gpu".to_string())).is_err());
}

#[test]
fn test_worker_pool_kind_from_str() {
    assert_eq!("on-demand".parse::<WorkerPoolKind>().unwrap(), WorkerPoolKind::OnDemand);
    assert_eq!(" Tokio ".parse::<WorkerPoolKind>().unwrap(), WorkerPoolKind::Tokio);
    assert!("threads".parse::<WorkerPoolKind>().is_err());
}
