//! Kernel-style concurrency primitives for hosted drivers
//!
//! Hosted drivers were written against a kernel's concurrency model: one
//! process-wide recursive lock, wait queues sharing a single condition
//! variable, semaphores, completions, a millisecond timer wheel, and a
//! deferred-work queue. This crate reproduces that model on ordinary OS
//! threads so the drivers never notice they are running in userspace.
//!
//! The cornerstone is [`GiantLock`]: a recursive lock whose blocking
//! primitives fully release it (down to depth zero) before sleeping and
//! restore the caller's acquisition depth afterwards. That discipline is
//! what lets a driver issue a blocking wait from code that already holds
//! the lock at arbitrary nesting.

pub mod lock;
pub mod sem;
pub mod timer;
pub mod work;

pub use lock::{GiantGuard, GiantLock, WaitQueue};
pub use sem::{Completion, KMutex, Semaphore};
pub use timer::{TimerHandle, TimerWheel};
pub use work::{DelayedWork, Tasklet, WorkItem, WorkQueue};
