//! Integration tests for the permit semaphore
//!
//! These tests run real threads against one semaphore and check:
//! - The owner bound under randomized acquire/release traffic
//! - Grant order for TAIL and HEAD insertions
//! - Hard cancellation of a parked acquirer
//! - Acquired-callbacks running outside the lock, before `release` returns
//! - Capacity increases granting several waiters in one call

use parking_lot::Mutex;
use prometheus_job_manager::core::{JobError, PermitSemaphore, QueuePosition, TaskHandle};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

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

// ============================================================================
// OWNER BOUND
// ============================================================================

#[test]
fn test_randomized_traffic_never_exceeds_permits() {
    const PERMITS: usize = 3;
    let sem = PermitSemaphore::new("stress", PERMITS);
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..12)
        .map(|i| {
            let task = member(&sem, &format!("worker-{i}"));
            let sem = Arc::clone(&sem);
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..40 {
                    let position = if rng.random_bool(0.3) {
                        QueuePosition::Head
                    } else {
                        QueuePosition::Tail
                    };
                    sem.acquire(&task, position, None).unwrap();
                    let now_inside = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now_inside, Ordering::SeqCst);
                    assert!(now_inside <= PERMITS);
                    thread::sleep(Duration::from_micros(rng.random_range(0..200)));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    sem.release(&task).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= PERMITS);
    assert_eq!(sem.owner_count(), 0);
    assert_eq!(sem.competitor_count(), 0);
    assert_eq!(sem.available_permits(), PERMITS);
}

// ============================================================================
// GRANT ORDER
// ============================================================================

#[test]
fn test_grant_order_follows_queue_order_with_head_first() {
    let sem = PermitSemaphore::new("ordered", 1);
    let holder = member(&sem, "holder");
    sem.acquire(&holder, QueuePosition::Tail, None).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut threads = Vec::new();
    for (queued, (name, position)) in [
        ("t1", QueuePosition::Tail),
        ("t2", QueuePosition::Tail),
        ("h1", QueuePosition::Head),
        ("t3", QueuePosition::Tail),
        ("h2", QueuePosition::Head),
    ]
    .into_iter()
    .enumerate()
    {
        let task = member(&sem, name);
        let sem_for_thread = Arc::clone(&sem);
        let order = Arc::clone(&order);
        threads.push(thread::spawn(move || {
            sem_for_thread.acquire(&task, position, None).unwrap();
            order.lock().push(task.name().to_string());
            sem_for_thread.release(&task).unwrap();
        }));
        wait_for("competitor to queue", || sem.competitor_count() == queued + 1);
    }

    sem.release(&holder).unwrap();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(*order.lock(), vec!["h1", "h2", "t1", "t2", "t3"]);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[test]
fn test_hard_cancel_unblocks_parked_acquirer() {
    let sem = PermitSemaphore::new("cancel", 1);
    let holder = member(&sem, "holder");
    sem.acquire(&holder, QueuePosition::Tail, None).unwrap();

    let waiter = member(&sem, "waiter");
    let parked = waiter.clone();
    let sem_for_thread = Arc::clone(&sem);
    let handle = thread::spawn(move || sem_for_thread.acquire(&parked, QueuePosition::Tail, None));

    wait_for("waiter to queue", || sem.competitor_count() == 1);
    waiter.cancel(true);

    let result = handle.join().unwrap();
    assert!(matches!(result, Err(JobError::Interrupted)));
    assert!(!result.unwrap_err().is_timeout());
    assert_eq!(sem.competitor_count(), 0);
    assert!(!sem.is_owner(&waiter));

    // The permit still goes to the next competitor, not to the cancelled one.
    sem.release(&holder).unwrap();
    assert_eq!(sem.available_permits(), 1);
}

#[test]
fn test_soft_cancel_does_not_interrupt_acquire() {
    let sem = PermitSemaphore::new("soft", 1);
    let holder = member(&sem, "holder");
    sem.acquire(&holder, QueuePosition::Tail, None).unwrap();

    let waiter = member(&sem, "waiter");
    waiter.cancel(false);
    let err = sem
        .acquire(&waiter, QueuePosition::Tail, Some(Duration::from_millis(30)))
        .unwrap_err();
    assert!(err.is_timeout());
}

// ============================================================================
// CALLBACKS
// ============================================================================

#[test]
fn test_acquired_callback_runs_before_release_returns_and_outside_lock() {
    let sem = PermitSemaphore::new("handoff", 1);
    let a = member(&sem, "a");
    let b = member(&sem, "b");
    sem.acquire(&a, QueuePosition::Tail, None).unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let callback_log = Arc::clone(&log);
    let callback_sem = Arc::clone(&sem);
    let callback_task = b.clone();
    let queued = sem
        .compete(&b, QueuePosition::Tail, move || {
            // Re-entering the semaphore would deadlock if the lock were held.
            assert!(callback_sem.is_owner(&callback_task));
            assert_eq!(callback_sem.available_permits(), 0);
            callback_sem.release(&callback_task).unwrap();
            callback_log.lock().push("b acquired");
        })
        .unwrap();
    assert!(!queued);

    sem.release(&a).unwrap();
    log.lock().push("a release returned");

    assert_eq!(*log.lock(), vec!["b acquired", "a release returned"]);
    assert!(sem.compete(&a, QueuePosition::Tail, || {}).unwrap(), "permit free again");
    sem.release(&a).unwrap();
}

#[test]
fn test_concurrent_reacquire_from_callback_thread() {
    let sem = PermitSemaphore::new("pingpong", 1);
    let a = member(&sem, "a");
    let b = member(&sem, "b");
    let rounds = Arc::new(AtomicUsize::new(0));

    sem.acquire(&a, QueuePosition::Tail, None).unwrap();
    let waiter_sem = Arc::clone(&sem);
    let waiter_task = b.clone();
    let waiter_rounds = Arc::clone(&rounds);
    let waiter = thread::spawn(move || {
        for _ in 0..50 {
            waiter_sem.acquire(&waiter_task, QueuePosition::Tail, None).unwrap();
            waiter_rounds.fetch_add(1, Ordering::SeqCst);
            waiter_sem.release(&waiter_task).unwrap();
        }
    });

    for _ in 0..50 {
        sem.release(&a).unwrap();
        sem.acquire(&a, QueuePosition::Tail, Some(Duration::from_secs(10))).unwrap();
    }
    sem.release(&a).unwrap();
    waiter.join().unwrap();
    assert_eq!(rounds.load(Ordering::SeqCst), 50);
    assert_eq!(sem.owner_count(), 0);
}

// ============================================================================
// CAPACITY
// ============================================================================

#[test]
fn test_capacity_increase_wakes_waiters_in_one_call() {
    let sem = PermitSemaphore::new("grow", 1);
    let holder = member(&sem, "holder");
    sem.acquire(&holder, QueuePosition::Tail, None).unwrap();

    let acquired = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<()>();
    let mut threads = Vec::new();
    for i in 0..3 {
        let task = member(&sem, &format!("w{i}"));
        let sem_for_thread = Arc::clone(&sem);
        let acquired = Arc::clone(&acquired);
        let done_rx = done_rx.clone();
        threads.push(thread::spawn(move || {
            sem_for_thread.acquire(&task, QueuePosition::Tail, None).unwrap();
            acquired.fetch_add(1, Ordering::SeqCst);
            let _ = done_rx.recv();
            sem_for_thread.release(&task).unwrap();
        }));
    }
    wait_for("three waiters", || sem.competitor_count() == 3);

    sem.with_permits(3).unwrap();
    assert_eq!(sem.owner_count(), 3, "two waiters granted inside with_permits");
    assert_eq!(sem.competitor_count(), 1);
    wait_for("two waiters to wake", || acquired.load(Ordering::SeqCst) == 2);

    sem.release(&holder).unwrap();
    wait_for("last waiter", || acquired.load(Ordering::SeqCst) == 3);
    drop(done_tx);
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(sem.owner_count(), 0);
}
