//! Tests for the tokio worker pool and API models

use prometheus_job_manager::core::{
    JobError, JobInput, JobManager, JobState, OneShotTrigger, PermitSemaphore, WorkerPool,
};
use prometheus_job_manager::runtime::{health, JobSnapshot, TokioWorkerPool};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_pool_runs_work() {
    let pool = TokioWorkerPool::try_current().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    pool.submit(
        "unit",
        Box::new(move || {
            tx.send(123).unwrap();
        }),
    )
    .unwrap();

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
    assert_eq!(pool.stats().submitted_tasks, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_pool_rejects_after_shutdown() {
    let pool = TokioWorkerPool::try_current().unwrap();
    pool.shutdown();
    assert!(pool.submit("unit", Box::new(|| {})).is_err());
}

#[test]
fn test_round_dropped_by_stopped_runtime_releases_permit() {
    let rt = tokio::runtime::Builder::new_multi_thread().worker_threads(1).build().unwrap();
    let handle = rt.handle().clone();
    rt.shutdown_background();

    let manager = JobManager::new(Arc::new(TokioWorkerPool::new(handle))).unwrap();
    let group = PermitSemaphore::new("gpu", 1);
    let future = manager
        .submit(JobInput::new("orphaned").with_permit_group(Arc::clone(&group)), |_cx| Ok(()))
        .unwrap();

    let result = future.await_done_and_get(Some(Duration::from_secs(10)));
    assert!(matches!(result, Err(JobError::PoolShutdown)));
    assert!(future.is_finished());
    assert_eq!(group.owner_count(), 0);
    assert_eq!(manager.registered_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manager_on_tokio_pool() {
    let pool = TokioWorkerPool::try_current().unwrap();
    let manager = JobManager::new(Arc::new(pool)).unwrap();
    let future = manager.submit(JobInput::new("async-caller"), |_cx| Ok(21 * 2)).unwrap();
    let value = future.await_done_and_get_async(Duration::from_secs(10)).await.unwrap();
    assert_eq!(value, 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_many_async_waiters() {
    let manager = JobManager::new(Arc::new(TokioWorkerPool::try_current().unwrap())).unwrap();
    let permits = PermitSemaphore::new("async-permits", 2);
    let futures: Vec<_> = (0..6_u32)
        .map(|i| {
            manager
                .submit(JobInput::new(format!("async-{i}")).with_permit_group(Arc::clone(&permits)), move |cx| {
                    cx.sleep(Duration::from_millis(5))?;
                    Ok(i)
                })
                .unwrap()
        })
        .collect();

    let results = futures::future::join_all(futures.iter().map(|f| f.await_done_and_get_async(Duration::from_secs(10)))).await;
    let values: Vec<u32> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
    manager.await_idle(Some(Duration::from_secs(10))).unwrap();
}

#[test]
fn test_snapshot_and_health() {
    let manager = JobManager::new(Arc::new(prometheus_job_manager::core::OnDemandWorkerPool::new())).unwrap();
    let future = manager
        .submit(
            JobInput::new("nightly").with_trigger(OneShotTrigger::after(Duration::from_secs(60))),
            |_cx| Ok(()),
        )
        .unwrap();

    let snapshot = JobSnapshot::from_handle(future.handle());
    assert_eq!(snapshot.task_name, "nightly");
    assert_eq!(snapshot.state, JobState::Pending);
    assert!(snapshot.next_execution_in_ms.is_some());
    assert!(snapshot.permit_group.is_none());

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["state"], "pending");

    let status = health(&manager);
    assert!(status.ok);
    assert_eq!(status.registered, 1);

    manager.shutdown().unwrap();
    assert!(!health(&manager).ok);
}
