//! Semaphores, the recursive driver mutex, and completions
//!
//! All three are thin state machines over [`GiantLock`] wait queues. The
//! counters are atomics only because Rust needs `Sync` storage; every
//! mutation happens while holding the giant lock, which is what actually
//! serializes them.

use crate::lock::{GiantLock, WaitQueue, thread_token};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Counting semaphore.
pub struct Semaphore {
    lock: Arc<GiantLock>,
    count: AtomicI32,
    wq: WaitQueue,
}

impl Semaphore {
    pub fn new(lock: Arc<GiantLock>, value: i32) -> Self {
        Self {
            lock,
            count: AtomicI32::new(value),
            wq: WaitQueue::new(),
        }
    }

    /// Release one permit and wake waiters.
    pub fn up(&self) {
        self.lock.lock();
        self.count.fetch_add(1, Ordering::Relaxed);
        self.lock.wake_all(&self.wq);
        self.lock.unlock();
    }

    /// Block until a permit is available, then take it.
    pub fn down(&self) {
        self.lock.lock();
        self.lock
            .wait_event(&self.wq, || self.count.load(Ordering::Relaxed) > 0);
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.lock.unlock();
    }

    /// Take a permit if one is available without blocking.
    pub fn try_down(&self) -> bool {
        self.lock.lock();
        let taken = self.count.load(Ordering::Relaxed) > 0;
        if taken {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        self.lock.unlock();
        taken
    }

    /// As [`down`](Self::down) with a deadline; returns `false` on timeout.
    pub fn down_timeout(&self, timeout_ms: u64) -> bool {
        self.lock.lock();
        let got = self.lock.wait_event_timeout(&self.wq, timeout_ms, || {
            self.count.load(Ordering::Relaxed) > 0
        });
        if got {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        self.lock.unlock();
        got
    }

    /// Current permit count; may go negative inside a [`KMutex`].
    pub fn value(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Recursive mutex over a binary semaphore with owner tracking.
///
/// Same-owner re-entry decrements the count without blocking, so the
/// count runs negative at depth. Unlock releases once; only when the
/// release restores a positive value is ownership cleared and the count
/// clamped back to 1, which keeps an unmatched extra unlock from pushing
/// the value past a single permit.
pub struct KMutex {
    lock: Arc<GiantLock>,
    count: AtomicI32,
    owner: AtomicU64,
    wq: WaitQueue,
}

impl KMutex {
    pub fn new(lock: Arc<GiantLock>) -> Self {
        Self {
            lock,
            count: AtomicI32::new(1),
            owner: AtomicU64::new(0),
            wq: WaitQueue::new(),
        }
    }

    pub fn lock(&self) {
        let me = thread_token();
        self.lock.lock();
        if self.owner.load(Ordering::Relaxed) == me {
            // Re-entry: no blocking, arbitrary depth
            self.count.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.lock
                .wait_event(&self.wq, || self.count.load(Ordering::Relaxed) > 0);
            self.count.fetch_sub(1, Ordering::Relaxed);
            self.owner.store(me, Ordering::Relaxed);
        }
        self.lock.unlock();
    }

    pub fn try_lock(&self) -> bool {
        let me = thread_token();
        self.lock.lock();
        let got = if self.owner.load(Ordering::Relaxed) == me {
            self.count.fetch_sub(1, Ordering::Relaxed);
            true
        } else if self.count.load(Ordering::Relaxed) > 0 {
            self.count.fetch_sub(1, Ordering::Relaxed);
            self.owner.store(me, Ordering::Relaxed);
            true
        } else {
            false
        };
        self.lock.unlock();
        got
    }

    pub fn unlock(&self) {
        self.lock.lock();
        let restored = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if restored > 0 {
            self.owner.store(0, Ordering::Relaxed);
            self.count.store(1, Ordering::Relaxed);
            self.lock.wake_all(&self.wq);
        }
        self.lock.unlock();
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != 0
    }

    pub fn owned_by_current(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == thread_token()
    }

    /// Raw semaphore value, exposed for tests and assertions.
    pub fn value(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Saturation marker used by [`Completion::complete_all`].
const COMPLETION_ALL: u32 = u32::MAX;

/// A counted "done" signal with the shared wait/wake mechanics.
pub struct Completion {
    lock: Arc<GiantLock>,
    done: AtomicU32,
    wq: WaitQueue,
}

impl Completion {
    pub fn new(lock: Arc<GiantLock>) -> Self {
        Self {
            lock,
            done: AtomicU32::new(0),
            wq: WaitQueue::new(),
        }
    }

    /// Signal one waiter.
    pub fn complete(&self) {
        self.lock.lock();
        if self.done.load(Ordering::Relaxed) != COMPLETION_ALL {
            self.done.fetch_add(1, Ordering::Relaxed);
        }
        self.lock.wake_all(&self.wq);
        self.lock.unlock();
    }

    /// Signal all current and future waiters.
    pub fn complete_all(&self) {
        self.lock.lock();
        self.done.store(COMPLETION_ALL, Ordering::Relaxed);
        self.lock.wake_all(&self.wq);
        self.lock.unlock();
    }

    /// Block until signalled, consuming one signal.
    pub fn wait(&self) {
        self.lock.lock();
        self.lock
            .wait_event(&self.wq, || self.done.load(Ordering::Relaxed) > 0);
        if self.done.load(Ordering::Relaxed) != COMPLETION_ALL {
            self.done.fetch_sub(1, Ordering::Relaxed);
        }
        self.lock.unlock();
    }

    /// As [`wait`](Self::wait) with a deadline; returns `false` on timeout.
    pub fn wait_timeout(&self, timeout_ms: u64) -> bool {
        self.lock.lock();
        let got = self.lock.wait_event_timeout(&self.wq, timeout_ms, || {
            self.done.load(Ordering::Relaxed) > 0
        });
        if got && self.done.load(Ordering::Relaxed) != COMPLETION_ALL {
            self.done.fetch_sub(1, Ordering::Relaxed);
        }
        self.lock.unlock();
        got
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn giant() -> Arc<GiantLock> {
        Arc::new(GiantLock::new())
    }

    #[test]
    fn test_semaphore_counts() {
        let sem = Semaphore::new(giant(), 2);
        assert!(sem.try_down());
        assert!(sem.try_down());
        assert!(!sem.try_down());
        sem.up();
        assert!(sem.try_down());
    }

    #[test]
    fn test_semaphore_down_timeout() {
        let sem = Semaphore::new(giant(), 0);
        assert!(!sem.down_timeout(30));
        sem.up();
        assert!(sem.down_timeout(30));
    }

    #[test]
    fn test_semaphore_blocks_until_up() {
        let lock = giant();
        let sem = Arc::new(Semaphore::new(lock, 0));
        let s = sem.clone();
        let handle = thread::spawn(move || s.down());
        thread::sleep(Duration::from_millis(50));
        sem.up();
        handle.join().unwrap();
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn test_kmutex_reentry_depth() {
        let m = KMutex::new(giant());
        m.lock();
        m.lock();
        m.lock();
        assert_eq!(m.value(), -2);
        assert!(m.owned_by_current());
        m.unlock();
        m.unlock();
        assert!(m.owned_by_current());
        m.unlock();
        assert!(!m.is_locked());
        assert_eq!(m.value(), 1);
    }

    #[test]
    fn test_kmutex_extra_unlock_clamps_at_one() {
        let m = KMutex::new(giant());
        m.lock();
        m.unlock();
        m.unlock();
        m.unlock();
        assert_eq!(m.value(), 1);
        // Still immediately lockable exactly once
        assert!(m.try_lock());
        assert!(m.owned_by_current());
    }

    #[test]
    fn test_kmutex_exclusion_needs_full_unwind() {
        let lock = giant();
        let m = Arc::new(KMutex::new(lock));
        m.lock();
        m.lock();

        let other = m.clone();
        let handle = thread::spawn(move || {
            assert!(!other.try_lock());
        });
        handle.join().unwrap();

        m.unlock();
        let other = m.clone();
        let handle = thread::spawn(move || {
            // One unlock down, one to go: still unavailable
            assert!(!other.try_lock());
        });
        handle.join().unwrap();

        m.unlock();
        let other = m.clone();
        let handle = thread::spawn(move || {
            assert!(other.try_lock());
            other.unlock();
        });
        handle.join().unwrap();
    }

    #[test]
    fn test_completion_wait_and_signal() {
        let c = Arc::new(Completion::new(giant()));
        let waiter = c.clone();
        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(30));
        c.complete();
        handle.join().unwrap();
        assert!(!c.is_done());
    }

    #[test]
    fn test_completion_timeout() {
        let c = Completion::new(giant());
        assert!(!c.wait_timeout(30));
        c.complete();
        assert!(c.wait_timeout(30));
    }

    #[test]
    fn test_complete_all_never_drains() {
        let c = Completion::new(giant());
        c.complete_all();
        c.wait();
        c.wait();
        assert!(c.is_done());
    }
}
