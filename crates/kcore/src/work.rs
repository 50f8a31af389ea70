//! The deferred-work queue and tasklets
//!
//! One FIFO, one worker thread. Scheduling is idempotent: an item already
//! linked into the FIFO is not linked twice, so calling `schedule` twice
//! before the worker dequeues it yields exactly one run. Item state is an
//! explicit enum rather than a link-pointer convention, so "is this item
//! queued" is a type-checked question.

use crate::lock::{GiantLock, WaitQueue, thread_token};
use crate::timer::{TimerHandle, TimerWheel};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::trace;

const STATE_IDLE: u8 = 0;
const STATE_QUEUED: u8 = 1;
const STATE_RUNNING: u8 = 2;

struct WorkInner {
    state: AtomicU8,
    callback: Box<dyn Fn() + Send + Sync>,
}

/// A deferred-work item. Clones share identity.
#[derive(Clone)]
pub struct WorkItem {
    inner: Arc<WorkInner>,
}

impl WorkItem {
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(WorkInner {
                state: AtomicU8::new(STATE_IDLE),
                callback: Box::new(callback),
            }),
        }
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Whether this item is currently linked into a FIFO.
    pub fn is_queued(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_QUEUED
    }
}

struct QueueInner {
    lock: Arc<GiantLock>,
    fifo: Mutex<VecDeque<WorkItem>>,
    /// Worker sleeps here when the FIFO drains
    wq: WaitQueue,
    /// Identity of the item whose callback is currently executing, 0 none
    current: AtomicUsize,
    /// Thread token of the worker, for self-cancellation detection
    worker_token: AtomicU64,
    stop: AtomicBool,
}

impl QueueInner {
    /// Idempotent append; caller need not hold the giant lock.
    fn schedule(&self, item: &WorkItem) {
        self.lock.lock();
        let state = &item.inner.state;
        // Running items may be re-queued; queued items are left alone
        if state
            .compare_exchange(STATE_IDLE, STATE_QUEUED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            || state
                .compare_exchange(STATE_RUNNING, STATE_QUEUED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.fifo.lock().unwrap().push_back(item.clone());
            trace!("work item queued");
        }
        self.lock.wake_all(&self.wq);
        self.lock.unlock();
    }
}

/// The deferred-work queue. Owns its worker thread.
pub struct WorkQueue {
    inner: Arc<QueueInner>,
    thread: Option<JoinHandle<()>>,
}

impl WorkQueue {
    pub fn new(lock: Arc<GiantLock>) -> Self {
        let inner = Arc::new(QueueInner {
            lock,
            fifo: Mutex::new(VecDeque::new()),
            wq: WaitQueue::new(),
            current: AtomicUsize::new(0),
            worker_token: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        });
        let worker_inner = inner.clone();
        let thread = std::thread::Builder::new()
            .name("workqueue".into())
            .spawn(move || worker_loop(worker_inner))
            .expect("spawn workqueue thread");
        Self {
            inner,
            thread: Some(thread),
        }
    }

    /// Queue `item` for execution. Scheduling an already-queued item is a
    /// no-op: two schedules before the worker dequeues it yield one run.
    pub fn schedule(&self, item: &WorkItem) {
        self.inner.schedule(item);
    }

    /// Arm a timer that schedules the item when it fires.
    pub fn schedule_delayed(&self, wheel: &TimerWheel, work: &DelayedWork, delay_ms: u64) {
        wheel.arm(work.timer, delay_ms);
    }

    /// Create a delayed-work pair bound to this queue.
    pub fn delayed_work(
        &self,
        wheel: &TimerWheel,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> DelayedWork {
        let item = WorkItem::new(callback);
        let queue = self.inner.clone();
        let timer_item = item.clone();
        let timer = wheel.create(Arc::new(move || queue.schedule(&timer_item)));
        DelayedWork { item, timer }
    }

    /// Unlink `item` from the FIFO if still queued.
    ///
    /// Returns `true` iff it was unlinked; a running or already-finished
    /// item is left alone.
    pub fn cancel(&self, item: &WorkItem) -> bool {
        self.inner.lock.lock();
        let cancelled = item
            .inner
            .state
            .compare_exchange(STATE_QUEUED, STATE_IDLE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if cancelled {
            let identity = item.identity();
            self.inner
                .fifo
                .lock()
                .unwrap()
                .retain(|queued| queued.identity() != identity);
        }
        self.inner.lock.unlock();
        cancelled
    }

    /// As [`cancel`](Self::cancel), then wait out any in-progress run.
    ///
    /// Never returns while the worker's current-item marker equals this
    /// item; yields with the giant lock fully dropped between checks.
    /// Calling this from the item's own callback would spin forever, so
    /// the worker thread itself skips the wait.
    pub fn cancel_and_wait(&self, item: &WorkItem) -> bool {
        let cancelled = self.cancel(item);
        if self.inner.worker_token.load(Ordering::SeqCst) == thread_token() {
            return cancelled;
        }
        let identity = item.identity();
        self.inner.lock.lock();
        while self.inner.current.load(Ordering::SeqCst) == identity {
            self.inner.lock.yield_unlocked();
        }
        self.inner.lock.unlock();
        cancelled
    }

    /// Cancel a delayed-work pair: its timer and, if already scheduled,
    /// the item itself.
    pub fn cancel_delayed(&self, wheel: &TimerWheel, work: &DelayedWork) -> bool {
        let timer_pending = wheel.cancel(work.timer);
        let item_queued = self.cancel(&work.item);
        timer_pending || item_queued
    }

    /// Identity of the currently executing item, for assertions.
    pub fn current_identity(&self) -> usize {
        self.inner.current.load(Ordering::SeqCst)
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.inner.lock.lock();
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.lock.wake_all(&self.inner.wq);
        self.inner.lock.unlock();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_loop(inner: Arc<QueueInner>) {
    inner.worker_token.store(thread_token(), Ordering::SeqCst);
    inner.lock.lock();
    loop {
        if inner.stop.load(Ordering::SeqCst) {
            break;
        }
        let next = inner.fifo.lock().unwrap().pop_front();
        match next {
            Some(item) => {
                item.inner.state.store(STATE_RUNNING, Ordering::SeqCst);
                inner.current.store(item.identity(), Ordering::SeqCst);
                inner.lock.unlocked(|| (item.inner.callback)());
                inner.current.store(0, Ordering::SeqCst);
                // A callback may have re-queued its own item; only a
                // still-Running item falls back to Idle
                let _ = item.inner.state.compare_exchange(
                    STATE_RUNNING,
                    STATE_IDLE,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
            None => {
                inner.lock.wait_event(&inner.wq, || {
                    inner.stop.load(Ordering::SeqCst)
                        || !inner.fifo.lock().unwrap().is_empty()
                });
            }
        }
    }
    inner.lock.unlock();
}

/// A work item paired with the wheel timer that schedules it.
pub struct DelayedWork {
    pub item: WorkItem,
    timer: TimerHandle,
}

/// Single-argument specialization of a work item.
pub struct Tasklet {
    item: WorkItem,
}

impl Tasklet {
    pub fn new(func: fn(usize), data: usize) -> Self {
        Self {
            item: WorkItem::new(move || func(data)),
        }
    }

    pub fn schedule(&self, queue: &WorkQueue) {
        queue.schedule(&self.item);
    }

    pub fn kill(&self, queue: &WorkQueue) {
        queue.cancel_and_wait(&self.item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue() -> (Arc<GiantLock>, WorkQueue) {
        let lock = Arc::new(GiantLock::new());
        let queue = WorkQueue::new(lock.clone());
        (lock, queue)
    }

    fn wait_for(cond: impl Fn() -> bool, limit_ms: u64) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(limit_ms) {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_item_runs() {
        let (_lock, queue) = queue();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let item = WorkItem::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        queue.schedule(&item);
        assert!(wait_for(|| ran.load(Ordering::SeqCst) == 1, 1000));
    }

    #[test]
    fn test_double_schedule_runs_once() {
        let (lock, queue) = queue();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let item = WorkItem::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        // Hold the giant lock so the worker cannot dequeue in between
        lock.lock();
        queue.schedule(&item);
        queue.schedule(&item);
        lock.unlock();

        assert!(wait_for(|| ran.load(Ordering::SeqCst) >= 1, 1000));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_queued_item() {
        let (lock, queue) = queue();
        let ran = Arc::new(AtomicUsize::new(0));

        // Block the worker with a long first item
        let gate = Arc::new(AtomicBool::new(false));
        let g = gate.clone();
        let blocker = WorkItem::new(move || {
            while !g.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        let r = ran.clone();
        let victim = WorkItem::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        lock.lock();
        queue.schedule(&blocker);
        queue.schedule(&victim);
        lock.unlock();

        std::thread::sleep(Duration::from_millis(20));
        assert!(queue.cancel(&victim));
        gate.store(true, Ordering::SeqCst);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_and_wait_outlasts_execution() {
        let (_lock, queue) = queue();
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let (s, f) = (started.clone(), finished.clone());
        let item = WorkItem::new(move || {
            s.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(80));
            f.store(true, Ordering::SeqCst);
        });

        queue.schedule(&item);
        assert!(wait_for(|| started.load(Ordering::SeqCst), 1000));

        queue.cancel_and_wait(&item);
        // The run that had already started must be fully over
        assert!(finished.load(Ordering::SeqCst));
        assert_ne!(queue.current_identity(), {
            let id = Arc::as_ptr(&item.inner) as usize;
            id
        });
    }

    #[test]
    fn test_delayed_work_fires_via_timer() {
        let lock = Arc::new(GiantLock::new());
        let wheel = TimerWheel::new(lock.clone());
        let queue = WorkQueue::new(lock);

        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let delayed = queue.delayed_work(&wheel, move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        queue.schedule_delayed(&wheel, &delayed, 30);
        assert!(wait_for(|| ran.load(Ordering::SeqCst) == 1, 3000));
    }

    #[test]
    fn test_cancel_delayed_before_timer_fires() {
        let lock = Arc::new(GiantLock::new());
        let wheel = TimerWheel::new(lock.clone());
        let queue = WorkQueue::new(lock);

        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let delayed = queue.delayed_work(&wheel, move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        queue.schedule_delayed(&wheel, &delayed, 5000);
        assert!(queue.cancel_delayed(&wheel, &delayed));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tasklet_convention() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn bump(data: usize) {
            HITS.fetch_add(data, Ordering::SeqCst);
        }

        let (_lock, queue) = queue();
        let tasklet = Tasklet::new(bump, 3);
        tasklet.schedule(&queue);
        assert!(wait_for(|| HITS.load(Ordering::SeqCst) == 3, 1000));
        tasklet.kill(&queue);
    }
}
