//! The process-wide recursive lock and wait queues
//!
//! All shared state in the compatibility layer (registries, FIFOs,
//! endpoint tables) is mutated only while holding one [`GiantLock`].
//! Blocking primitives release the lock down to depth zero before
//! sleeping and restore the saved depth on wakeup, so a driver may block
//! while holding the lock at arbitrary re-entry depth.
//!
//! Every [`WaitQueue`] shares the lock's single event condition variable:
//! a wakeup broadcasts unconditionally and each sleeper re-checks its own
//! predicate, which makes the whole scheme spurious-wakeup-tolerant by
//! construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Process-local identity of the calling thread; never zero.
pub(crate) fn thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

/// A wait queue: a monotonically increasing generation counter.
///
/// Sleepers snapshot the generation before releasing the giant lock and
/// sleep until it moves. The counter is the only state; the condition
/// variable itself lives in the [`GiantLock`].
#[derive(Debug, Default)]
pub struct WaitQueue {
    generation: AtomicU64,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    fn current(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct LockState {
    /// Thread token of the owner, 0 when free
    owner: u64,
    /// Recursive acquisition depth of the owner
    depth: u32,
}

/// The process-wide recursive lock.
///
/// Built from one state mutex and two condition variables: `handoff` for
/// threads contending for the lock itself, and `events` shared by every
/// wait queue in the process. None of the operations can fail; a timed
/// wait reports timeout through its return value.
#[derive(Debug, Default)]
pub struct GiantLock {
    state: Mutex<LockState>,
    handoff: Condvar,
    events: Condvar,
}

impl GiantLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, recursively if already held by this thread.
    pub fn lock(&self) {
        let me = thread_token();
        let mut st = self.state.lock().unwrap();
        if st.owner == me {
            st.depth += 1;
            return;
        }
        while st.owner != 0 {
            st = self.handoff.wait(st).unwrap();
        }
        st.owner = me;
        st.depth = 1;
    }

    /// Release one level of acquisition.
    pub fn unlock(&self) {
        let mut st = self.state.lock().unwrap();
        debug_assert_eq!(st.owner, thread_token(), "unlock by non-owner");
        debug_assert!(st.depth > 0, "unbalanced unlock");
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = 0;
            drop(st);
            self.handoff.notify_one();
        }
    }

    /// Acquire and return a guard that releases one level on drop.
    pub fn guard(&self) -> GiantGuard<'_> {
        self.lock();
        GiantGuard { lock: self }
    }

    /// Whether the calling thread currently holds the lock.
    pub fn held(&self) -> bool {
        self.state.lock().unwrap().owner == thread_token()
    }

    /// The calling thread's acquisition depth (0 when not the owner).
    pub fn depth(&self) -> u32 {
        let st = self.state.lock().unwrap();
        if st.owner == thread_token() { st.depth } else { 0 }
    }

    /// Block until `condition` holds. The caller must hold the lock.
    ///
    /// While sleeping the lock is released down to depth zero and the
    /// released depth is restored before `condition` is re-tested, so the
    /// caller's nesting is preserved across the wait.
    pub fn wait_event<F>(&self, queue: &WaitQueue, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let me = thread_token();
        loop {
            if condition() {
                return;
            }
            let snapshot = queue.current();
            let mut st = self.state.lock().unwrap();
            debug_assert_eq!(st.owner, me, "wait_event without holding the lock");
            let saved = st.depth;
            st.owner = 0;
            st.depth = 0;
            self.handoff.notify_one();
            while queue.current() == snapshot {
                st = self.events.wait(st).unwrap();
            }
            while st.owner != 0 {
                st = self.handoff.wait(st).unwrap();
            }
            st.owner = me;
            st.depth = saved;
        }
    }

    /// As [`wait_event`](Self::wait_event) with a deadline.
    ///
    /// The deadline is computed from `timeout_ms` once, before first
    /// blocking, so time spent re-acquiring the lock between wakeups does
    /// not shorten the effective timeout. Returns `true` if the condition
    /// was met, `false` on timeout (after a final re-check).
    pub fn wait_event_timeout<F>(&self, queue: &WaitQueue, timeout_ms: u64, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let me = thread_token();
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if condition() {
                return true;
            }
            let snapshot = queue.current();
            let mut st = self.state.lock().unwrap();
            debug_assert_eq!(st.owner, me, "wait_event_timeout without holding the lock");
            let saved = st.depth;
            st.owner = 0;
            st.depth = 0;
            self.handoff.notify_one();
            let mut timed_out = false;
            while queue.current() == snapshot {
                let now = Instant::now();
                if now >= deadline {
                    timed_out = true;
                    break;
                }
                let (guard, _) = self.events.wait_timeout(st, deadline - now).unwrap();
                st = guard;
            }
            while st.owner != 0 {
                st = self.handoff.wait(st).unwrap();
            }
            st.owner = me;
            st.depth = saved;
            drop(st);
            if timed_out {
                return condition();
            }
        }
    }

    /// Wake all sleepers on `queue`.
    ///
    /// Bumps the queue generation and broadcasts the shared condition
    /// variable unconditionally; every sleeper re-checks its own
    /// predicate.
    pub fn wake_all(&self, queue: &WaitQueue) {
        let _st = self.state.lock().unwrap();
        queue.bump();
        self.events.notify_all();
    }

    /// Wake sleepers on `queue`.
    ///
    /// Identical to [`wake_all`](Self::wake_all): with one shared
    /// condition variable there is no targeted wakeup, only broadcast.
    pub fn wake(&self, queue: &WaitQueue) {
        self.wake_all(queue);
    }

    /// Run `f` with the lock fully released.
    ///
    /// The caller must hold the lock; its depth is saved, the lock is
    /// dropped to zero for the duration of `f`, and the depth restored
    /// before returning. Completion and timer callbacks are invoked
    /// through this so they may themselves acquire the lock or block.
    pub fn unlocked<R>(&self, f: impl FnOnce() -> R) -> R {
        let me = thread_token();
        let saved = {
            let mut st = self.state.lock().unwrap();
            debug_assert_eq!(st.owner, me, "unlocked() without holding the lock");
            let saved = st.depth;
            st.owner = 0;
            st.depth = 0;
            saved
        };
        self.handoff.notify_one();

        let out = f();

        let mut st = self.state.lock().unwrap();
        while st.owner != 0 {
            st = self.handoff.wait(st).unwrap();
        }
        st.owner = me;
        st.depth = saved;
        out
    }

    /// Yield the CPU with the lock fully released, then re-acquire.
    ///
    /// Used by drain-style cancellation loops.
    pub fn yield_unlocked(&self) {
        self.unlocked(std::thread::yield_now);
    }
}

/// RAII guard for one acquisition level of a [`GiantLock`].
pub struct GiantGuard<'a> {
    lock: &'a GiantLock,
}

impl Drop for GiantGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn test_recursive_acquire_release() {
        let lock = GiantLock::new();
        lock.lock();
        lock.lock();
        lock.lock();
        assert_eq!(lock.depth(), 3);
        lock.unlock();
        lock.unlock();
        assert!(lock.held());
        lock.unlock();
        assert!(!lock.held());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let lock = GiantLock::new();
        {
            let _g = lock.guard();
            assert!(lock.held());
        }
        assert!(!lock.held());
    }

    #[test]
    fn test_exclusion_across_threads() {
        let lock = Arc::new(GiantLock::new());
        let flag = Arc::new(AtomicBool::new(false));

        lock.lock();
        let (l, f) = (lock.clone(), flag.clone());
        let handle = thread::spawn(move || {
            l.lock();
            f.store(true, Ordering::SeqCst);
            l.unlock();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!flag.load(Ordering::SeqCst));
        lock.unlock();
        handle.join().unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wait_event_restores_depth() {
        let lock = Arc::new(GiantLock::new());
        let queue = Arc::new(WaitQueue::new());
        let ready = Arc::new(AtomicBool::new(false));

        let (l, q, r) = (lock.clone(), queue.clone(), ready.clone());
        let waiter = thread::spawn(move || {
            l.lock();
            l.lock();
            l.lock();
            l.wait_event(&q, || r.load(Ordering::SeqCst));
            assert_eq!(l.depth(), 3);
            l.unlock();
            l.unlock();
            l.unlock();
        });

        thread::sleep(Duration::from_millis(50));
        lock.lock();
        ready.store(true, Ordering::SeqCst);
        lock.wake_all(&queue);
        lock.unlock();
        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_event_timeout_expires() {
        let lock = GiantLock::new();
        let queue = WaitQueue::new();
        lock.lock();
        let start = Instant::now();
        let met = lock.wait_event_timeout(&queue, 50, || false);
        assert!(!met);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(lock.held());
        lock.unlock();
    }

    #[test]
    fn test_wait_event_timeout_met_immediately() {
        let lock = GiantLock::new();
        let queue = WaitQueue::new();
        lock.lock();
        assert!(lock.wait_event_timeout(&queue, 1000, || true));
        lock.unlock();
    }

    #[test]
    fn test_unlocked_releases_and_restores() {
        let lock = Arc::new(GiantLock::new());
        lock.lock();
        lock.lock();

        let l = lock.clone();
        let out = lock.unlocked(move || {
            // Another thread can take the lock while we are out
            let h = thread::spawn(move || {
                l.lock();
                l.unlock();
                7
            });
            h.join().unwrap()
        });
        assert_eq!(out, 7);
        assert_eq!(lock.depth(), 2);
        lock.unlock();
        lock.unlock();
    }
}
