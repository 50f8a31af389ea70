//! The timer wheel and the virtual millisecond clock
//!
//! A background thread advances a software millisecond counter by the
//! interval it slept and expires armed timers against it. Timers live in
//! an arena of slots; a [`TimerHandle`] carries the slot index plus a
//! slot generation so a stale handle can never touch a recycled slot.
//!
//! After every fired callback the expiry scan restarts from the top of
//! the arena: a callback may arm or cancel arbitrary other timers, and
//! restarting is what keeps the traversal valid under that mutation.

use crate::lock::{GiantLock, WaitQueue};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::trace;

/// Wheel tick while any timer is armed, in virtual milliseconds.
const TICK_MS: u64 = 20;

/// Wheel tick while nothing is armed.
const IDLE_TICK_MS: u64 = 1000;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle to one timer slot. Copyable; stale generations are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    index: usize,
    generation: u64,
}

struct TimerSlot {
    generation: u64,
    callback: TimerCallback,
    /// Absolute virtual expiry, meaningful only while armed
    expires: u64,
    armed: bool,
}

#[derive(Default)]
struct WheelState {
    slots: Vec<Option<TimerSlot>>,
    free: Vec<usize>,
    armed: usize,
    next_generation: u64,
}

/// Sleep/nudge rendezvous for the wheel thread.
#[derive(Default)]
struct Parker {
    nudged: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    fn sleep(&self, interval: Duration) {
        let mut nudged = self.nudged.lock().unwrap();
        if !*nudged {
            let (guard, _) = self.cv.wait_timeout(nudged, interval).unwrap();
            nudged = guard;
        }
        *nudged = false;
    }

    fn nudge(&self) {
        *self.nudged.lock().unwrap() = true;
        self.cv.notify_one();
    }
}

struct WheelInner {
    lock: Arc<GiantLock>,
    state: Mutex<WheelState>,
    jiffies: AtomicU64,
    parker: Parker,
    shutdown: AtomicBool,
}

/// The timer wheel. One per process; owns its background thread.
pub struct TimerWheel {
    inner: Arc<WheelInner>,
    thread: Option<JoinHandle<()>>,
    /// Wakes anyone sleeping on a wheel-driven timeout; unused by the
    /// wheel itself but co-located so timer users can share it
    pub expiry_wq: WaitQueue,
}

impl TimerWheel {
    pub fn new(lock: Arc<GiantLock>) -> Self {
        let inner = Arc::new(WheelInner {
            lock,
            state: Mutex::new(WheelState::default()),
            jiffies: AtomicU64::new(0),
            parker: Parker::default(),
            shutdown: AtomicBool::new(false),
        });
        let thread_inner = inner.clone();
        let thread = std::thread::Builder::new()
            .name("timer-wheel".into())
            .spawn(move || wheel_loop(thread_inner))
            .expect("spawn timer wheel thread");
        Self {
            inner,
            thread: Some(thread),
            expiry_wq: WaitQueue::new(),
        }
    }

    /// Current virtual time in milliseconds.
    pub fn jiffies(&self) -> u64 {
        self.inner.jiffies.load(Ordering::SeqCst)
    }

    /// Create an unarmed timer. The wheel never frees the callback until
    /// [`destroy`](Self::destroy).
    pub fn create(&self, callback: TimerCallback) -> TimerHandle {
        self.inner.lock.lock();
        let mut st = self.inner.state.lock().unwrap();
        st.next_generation += 1;
        let generation = st.next_generation;
        let slot = TimerSlot {
            generation,
            callback,
            expires: 0,
            armed: false,
        };
        let index = match st.free.pop() {
            Some(index) => {
                st.slots[index] = Some(slot);
                index
            }
            None => {
                st.slots.push(Some(slot));
                st.slots.len() - 1
            }
        };
        drop(st);
        self.inner.lock.unlock();
        TimerHandle { index, generation }
    }

    /// Cancel and free a timer slot.
    pub fn destroy(&self, handle: TimerHandle) {
        self.inner.lock.lock();
        let mut guard = self.inner.state.lock().unwrap();
        let st = &mut *guard;
        let live = matches!(
            st.slots.get(handle.index).and_then(Option::as_ref),
            Some(slot) if slot.generation == handle.generation
        );
        if live {
            if st.slots[handle.index].as_ref().unwrap().armed {
                st.armed -= 1;
            }
            st.slots[handle.index] = None;
            st.free.push(handle.index);
        }
        drop(guard);
        self.inner.lock.unlock();
    }

    /// Arm (or re-arm) a timer `delay_ms` virtual milliseconds from now.
    ///
    /// An already-armed timer is cancelled first, so a handle is pending
    /// at most once.
    pub fn arm(&self, handle: TimerHandle, delay_ms: u64) {
        let now = self.jiffies();
        self.inner.lock.lock();
        {
            let mut guard = self.inner.state.lock().unwrap();
            let st = &mut *guard;
            if let Some(slot) = st.slots.get_mut(handle.index).and_then(Option::as_mut) {
                if slot.generation == handle.generation {
                    if !slot.armed {
                        slot.armed = true;
                        st.armed += 1;
                    }
                    slot.expires = now + delay_ms;
                }
            }
        }
        self.inner.lock.unlock();
        // A fresh near-term timer must not wait out the idle tick
        self.inner.parker.nudge();
    }

    /// Disarm a timer; `true` iff it was actually pending.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        self.inner.lock.lock();
        let mut st = self.inner.state.lock().unwrap();
        let was_pending = match st.slots.get_mut(handle.index).and_then(Option::as_mut) {
            Some(slot) if slot.generation == handle.generation && slot.armed => {
                slot.armed = false;
                true
            }
            _ => false,
        };
        if was_pending {
            st.armed -= 1;
        }
        drop(st);
        self.inner.lock.unlock();
        was_pending
    }

    /// Whether a timer is currently armed.
    pub fn pending(&self, handle: TimerHandle) -> bool {
        let st = self.inner.state.lock().unwrap();
        matches!(
            st.slots.get(handle.index).and_then(Option::as_ref),
            Some(slot) if slot.generation == handle.generation && slot.armed
        )
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.parker.nudge();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn wheel_loop(inner: Arc<WheelInner>) {
    let mut slept_ms = 0u64;
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        inner.lock.lock();
        let now = inner.jiffies.fetch_add(slept_ms, Ordering::SeqCst) + slept_ms;

        // Expire due timers. Each callback runs with the lock dropped and
        // may arm or cancel arbitrary timers, so restart the scan after
        // every one; fired entries are disarmed, which guarantees progress.
        loop {
            let due = {
                let mut st = inner.state.lock().unwrap();
                let mut found = None;
                for slot in st.slots.iter_mut().flatten() {
                    if slot.armed && slot.expires <= now {
                        slot.armed = false;
                        found = Some(slot.callback.clone());
                        break;
                    }
                }
                if found.is_some() {
                    st.armed -= 1;
                }
                found
            };
            match due {
                Some(callback) => {
                    trace!("timer fired at virtual {}ms", now);
                    inner.lock.unlocked(|| callback());
                }
                None => break,
            }
        }

        let any_armed = inner.state.lock().unwrap().armed > 0;
        inner.lock.unlock();

        let tick = if any_armed { TICK_MS } else { IDLE_TICK_MS };
        inner.parker.sleep(Duration::from_millis(tick));
        slept_ms = tick;
    }
}
