//! Integration tests for the concurrency core
//!
//! Exercises the primitives the way hosted drivers combine them: blocking
//! waits issued at arbitrary lock depth, completions signalled from timer
//! and work callbacks, and drain-style cancellation.

use kcore::{Completion, GiantLock, KMutex, TimerWheel, WaitQueue, WorkItem, WorkQueue};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn wait_for(cond: impl Fn() -> bool, limit_ms: u64) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(limit_ms) {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn test_blocking_wait_from_nested_lock_depth() {
    let lock = Arc::new(GiantLock::new());
    let queue = Arc::new(WaitQueue::new());
    let ready = Arc::new(AtomicBool::new(false));
    let woke = Arc::new(AtomicBool::new(false));

    let (l, q, r, w) = (lock.clone(), queue.clone(), ready.clone(), woke.clone());
    let waiter = thread::spawn(move || {
        // A driver deep in its own call chain still gets to block
        l.lock();
        l.lock();
        l.lock();
        l.lock();
        l.wait_event(&q, || r.load(Ordering::SeqCst));
        assert_eq!(l.depth(), 4);
        w.store(true, Ordering::SeqCst);
        for _ in 0..4 {
            l.unlock();
        }
    });

    // The waiter's nested acquisitions must not wedge other threads
    assert!(wait_for(
        || {
            lock.lock();
            let got = true;
            lock.unlock();
            got
        },
        1000
    ));

    lock.lock();
    ready.store(true, Ordering::SeqCst);
    lock.wake_all(&queue);
    lock.unlock();

    waiter.join().unwrap();
    assert!(woke.load(Ordering::SeqCst));
}

#[test]
fn test_completion_signalled_from_timer_callback() {
    let lock = Arc::new(GiantLock::new());
    let wheel = TimerWheel::new(lock.clone());
    let done = Arc::new(Completion::new(lock));

    let signal = done.clone();
    let timer = wheel.create(Arc::new(move || signal.complete()));
    wheel.arm(timer, 30);

    assert!(done.wait_timeout(3000));
}

#[test]
fn test_completion_signalled_from_work_callback() {
    let lock = Arc::new(GiantLock::new());
    let queue = WorkQueue::new(lock.clone());
    let done = Arc::new(Completion::new(lock));

    let signal = done.clone();
    let item = WorkItem::new(move || signal.complete());
    queue.schedule(&item);

    assert!(done.wait_timeout(3000));
}

#[test]
fn test_work_callback_may_take_the_lock_and_a_mutex() {
    let lock = Arc::new(GiantLock::new());
    let queue = WorkQueue::new(lock.clone());
    let mutex = Arc::new(KMutex::new(lock.clone()));
    let ran = Arc::new(AtomicUsize::new(0));

    let (l, m, r) = (lock.clone(), mutex.clone(), ran.clone());
    let item = WorkItem::new(move || {
        l.lock();
        m.lock();
        m.lock();
        r.fetch_add(1, Ordering::SeqCst);
        m.unlock();
        m.unlock();
        l.unlock();
    });
    queue.schedule(&item);

    assert!(wait_for(|| ran.load(Ordering::SeqCst) == 1, 2000));
    assert!(!mutex.is_locked());
}

#[test]
fn test_timed_wait_deadline_is_absolute() {
    let lock = Arc::new(GiantLock::new());
    let queue = Arc::new(WaitQueue::new());

    // Wake the sleeper repeatedly without satisfying its predicate; each
    // wake re-enters the wait, which must not extend the deadline.
    let (l, q) = (lock.clone(), queue.clone());
    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    let noise = thread::spawn(move || {
        while !s.load(Ordering::SeqCst) {
            l.lock();
            l.wake_all(&q);
            l.unlock();
            thread::sleep(Duration::from_millis(10));
        }
    });

    lock.lock();
    let start = Instant::now();
    let met = lock.wait_event_timeout(&queue, 100, || false);
    let elapsed = start.elapsed();
    lock.unlock();

    stop.store(true, Ordering::SeqCst);
    noise.join().unwrap();

    assert!(!met);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(2000));
}

#[test]
fn test_semaphore_handoff_between_threads() {
    let lock = Arc::new(GiantLock::new());
    let sem = Arc::new(kcore::Semaphore::new(lock, 0));
    let order = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let (s, o) = (sem.clone(), order.clone());
        handles.push(thread::spawn(move || {
            s.down();
            o.fetch_add(1, Ordering::SeqCst);
        }));
    }

    thread::sleep(Duration::from_millis(30));
    assert_eq!(order.load(Ordering::SeqCst), 0);

    sem.up();
    assert!(wait_for(|| order.load(Ordering::SeqCst) == 1, 1000));
    sem.up();
    sem.up();
    assert!(wait_for(|| order.load(Ordering::SeqCst) == 3, 1000));

    for handle in handles {
        handle.join().unwrap();
    }
}
