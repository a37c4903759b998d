//! Integration tests for blocking conditions
//!
//! A task parked on an armed condition must give its permit back while
//! parked and hold a permit again before it resumes.

use prometheus_job_manager::core::{
    BlockingCondition, JobContext, JobError, JobState, PermitSemaphore, QueuePosition, TaskHandle,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn member(sem: &Arc<PermitSemaphore>, name: &str) -> TaskHandle {
    TaskHandle::new(name, Some(Arc::clone(sem)))
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();
    while !condition() {
        assert!(started.elapsed() < Duration::from_secs(10), "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Acquire for `task`, then park it on `condition` on a new thread.
fn park(
    sem: &Arc<PermitSemaphore>,
    condition: &Arc<BlockingCondition>,
    task: &TaskHandle,
    resumed: &Arc<AtomicBool>,
) -> thread::JoinHandle<Result<(), JobError>> {
    sem.acquire(task, QueuePosition::Tail, None).unwrap();
    let cx = JobContext::for_task(task.clone());
    let condition = Arc::clone(condition);
    let resumed = Arc::clone(resumed);
    thread::spawn(move || {
        let result = condition.wait_for(&cx, None);
        resumed.store(true, Ordering::SeqCst);
        result
    })
}

#[test]
fn test_permit_released_while_parked_and_regained_before_resume() {
    let sem = PermitSemaphore::new("gpu", 1);
    let condition = Arc::new(BlockingCondition::new("model-loaded", true));
    let a = member(&sem, "a");
    let b = member(&sem, "b");
    let resumed = Arc::new(AtomicBool::new(false));

    let parked = park(&sem, &condition, &a, &resumed);
    wait_for("a to park", || a.state() == JobState::WaitingForBlockingCondition && sem.owner_count() == 0);
    assert_eq!(condition.waiter_count(), 1);

    // The released permit is usable by another task.
    sem.acquire(&b, QueuePosition::Tail, Some(Duration::from_secs(5))).unwrap();

    condition.set_blocking(false);
    wait_for("a to wait for its permit", || a.state() == JobState::WaitingForPermit);
    thread::sleep(Duration::from_millis(30));
    assert!(!resumed.load(Ordering::SeqCst), "resumed without a permit");

    sem.release(&b).unwrap();
    parked.join().unwrap().unwrap();
    assert!(resumed.load(Ordering::SeqCst));
    assert!(sem.is_owner(&a));
    assert_eq!(condition.waiter_count(), 0);
}

#[test]
fn test_resumed_task_reacquires_ahead_of_tail_competitors() {
    let sem = PermitSemaphore::new("cpu", 1);
    let condition = Arc::new(BlockingCondition::new("gate", true));
    let a = member(&sem, "a");
    let b = member(&sem, "b");
    let c = member(&sem, "c");
    let resumed = Arc::new(AtomicBool::new(false));

    let parked = park(&sem, &condition, &a, &resumed);
    wait_for("a to park", || sem.owner_count() == 0 && a.state() == JobState::WaitingForBlockingCondition);
    sem.acquire(&b, QueuePosition::Tail, None).unwrap();

    let c_granted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&c_granted);
    assert!(!sem.compete(&c, QueuePosition::Tail, move || flag.store(true, Ordering::SeqCst)).unwrap());

    condition.set_blocking(false);
    wait_for("a to queue at the head", || sem.competitor_count() == 2);

    sem.release(&b).unwrap();
    parked.join().unwrap().unwrap();
    assert!(sem.is_owner(&a));
    assert!(!c_granted.load(Ordering::SeqCst));

    sem.release(&a).unwrap();
    assert!(c_granted.load(Ordering::SeqCst));
}

#[test]
fn test_timeout_reports_timeout_after_reacquiring() {
    let sem = PermitSemaphore::new("cpu", 1);
    let condition = BlockingCondition::new("never", true);
    let task = member(&sem, "sleeper");
    sem.acquire(&task, QueuePosition::Tail, None).unwrap();

    let cx = JobContext::for_task(task.clone());
    let err = condition.wait_for(&cx, Some(Duration::from_millis(25))).unwrap_err();
    assert!(matches!(err, JobError::Timeout(_)));
    assert!(sem.is_owner(&task));
}

#[test]
fn test_hard_cancel_while_parked_skips_reacquisition() {
    let sem = PermitSemaphore::new("cpu", 1);
    let condition = Arc::new(BlockingCondition::new("gate", true));
    let task = member(&sem, "victim");
    let resumed = Arc::new(AtomicBool::new(false));

    let parked = park(&sem, &condition, &task, &resumed);
    wait_for("task to park", || condition.waiter_count() == 1 && sem.owner_count() == 0);
    task.cancel(true);

    let err = parked.join().unwrap().unwrap_err();
    assert!(err.is_interrupted());
    assert!(!sem.is_owner(&task));
    assert_eq!(sem.available_permits(), 1);
    assert_eq!(condition.waiter_count(), 0);
}

#[test]
fn test_disarmed_condition_passes_through_without_releasing() {
    let sem = PermitSemaphore::new("cpu", 1);
    let condition = BlockingCondition::new("open", false);
    let task = member(&sem, "runner");
    sem.acquire(&task, QueuePosition::Tail, None).unwrap();

    condition.wait_task(&task, None).unwrap();
    assert!(sem.is_owner(&task));
    assert!(!condition.is_blocking());
}
