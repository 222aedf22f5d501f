//! Synchronization primitives layered on cooperative dispatch.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::context::ThreadId;
use crate::sched;

/// A busy-waiting mutual-exclusion lock.
///
/// Critical sections are expected to be short and must not dispatch while
/// the lock is held; waiting for a condition belongs to
/// [`ConditionVariable`]. Because tasks are never preempted within a core,
/// a contended holder is always actually running on another core, so
/// spinning never waits on a suspended task.
pub struct SpinLock {
    // false means free, true means held.
    state: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        SpinLock {
            state: AtomicBool::new(false),
        }
    }

    /// Busy-wait until the lock is acquired.
    pub fn lock(&self) {
        while self.state.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    /// One acquisition attempt.
    ///
    /// Returns whether the lock was free and is now held by the caller.
    pub fn try_lock(&self) -> bool {
        !self.state.swap(true, Ordering::Acquire)
    }

    /// Release the lock.
    pub fn unlock(&self) {
        self.state.store(false, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocks tasks until a condition may hold, waking them in FIFO order.
///
/// The queue itself carries no lock: by convention every `wait`,
/// `notify_one` and `notify_all` for a given condition runs while holding
/// the same external [`SpinLock`], which serializes queue access. A `wait`
/// whose enqueue is not covered by that lock can lose a wakeup.
///
/// There are no spurious wakeups by construction, but callers should still
/// re-check their predicate in a loop.
pub struct ConditionVariable {
    // FIFO of waiters; entries whose task has since exited are dropped at
    // notify time via the generation check.
    blocked_threads: UnsafeCell<VecDeque<ThreadId>>,
}

// Access to the queue is serialized by the caller-held external lock.
unsafe impl Send for ConditionVariable {}
unsafe impl Sync for ConditionVariable {}

impl ConditionVariable {
    pub const fn new() -> Self {
        ConditionVariable {
            blocked_threads: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// Queue the calling task and block until notified.
    ///
    /// `lock` must be held on entry; it is released for the duration of the
    /// block and re-acquired before returning. Must be called from a task.
    pub fn wait(&self, lock: &SpinLock) {
        let id = sched::current_thread_id();
        debug_assert!(!id.is_null(), "ConditionVariable::wait outside a task");
        unsafe { (*self.blocked_threads.get()).push_back(id) };
        sched::block_and_release(lock);
        lock.lock();
    }

    /// Wake the first queued task that is still the live occupant of its
    /// slot; stale entries are dropped.
    pub fn notify_one(&self) {
        let queue = unsafe { &mut *self.blocked_threads.get() };
        while let Some(id) = queue.pop_front() {
            if sched::wake(id) {
                return;
            }
        }
    }

    /// Drain the queue, waking every still-live entry.
    pub fn notify_all(&self) {
        let queue = unsafe { &mut *self.blocked_threads.get() };
        while let Some(id) = queue.pop_front() {
            sched::wake(id);
        }
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::thread;

    use crate::context::{BLOCKED, ThreadContext};

    struct Guarded {
        lock: SpinLock,
        value: UnsafeCell<u64>,
    }
    unsafe impl Sync for Guarded {}

    #[test]
    fn lock_provides_mutual_exclusion() {
        let shared = Guarded {
            lock: SpinLock::new(),
            value: UnsafeCell::new(0),
        };

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let shared = &shared;
                    for _ in 0..10_000 {
                        shared.lock.lock();
                        unsafe { *shared.value.get() += 1 };
                        shared.lock.unlock();
                    }
                });
            }
        });

        assert_eq!(unsafe { *shared.value.get() }, 40_000);
    }

    #[test]
    fn try_lock_observes_holder() {
        let lock = SpinLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    /// A context parked as a waiter would be, plus the handle it enqueued.
    /// Boxed so the handle's pointer stays valid across the move out.
    fn parked_waiter(id_in_core: u8) -> (Box<ThreadContext>, ThreadId) {
        let context = Box::new(ThreadContext::new(id_in_core));
        context
            .wakeup_time_in_cycles
            .store(BLOCKED, Ordering::Release);
        let id = ThreadId::new(&*context, context.generation.load(Ordering::Relaxed));
        (context, id)
    }

    #[test]
    fn notify_one_wakes_waiters_in_fifo_order() {
        let (first_context, first) = parked_waiter(0);
        let (second_context, second) = parked_waiter(1);

        let cv = ConditionVariable::new();
        unsafe {
            (*cv.blocked_threads.get()).push_back(first);
            (*cv.blocked_threads.get()).push_back(second);
        }

        cv.notify_one();
        assert_eq!(
            first_context.wakeup_time_in_cycles.load(Ordering::Acquire),
            0
        );
        assert_eq!(
            second_context.wakeup_time_in_cycles.load(Ordering::Acquire),
            BLOCKED
        );
        assert_eq!(unsafe { (*cv.blocked_threads.get()).len() }, 1);

        cv.notify_one();
        assert_eq!(
            second_context.wakeup_time_in_cycles.load(Ordering::Acquire),
            0
        );
        assert!(unsafe { (*cv.blocked_threads.get()).is_empty() });
    }

    #[test]
    fn notify_one_drops_stale_head_and_wakes_next_live_waiter() {
        // A handle minted before the slot's task finished goes stale once
        // the generation is bumped; notify must drop it, not wake the
        // slot's successor.
        let (stale_context, stale) = parked_waiter(0);
        stale_context.generation.fetch_add(1, Ordering::Release);

        let (live_context, live) = parked_waiter(1);

        let cv = ConditionVariable::new();
        unsafe {
            (*cv.blocked_threads.get()).push_back(stale);
            (*cv.blocked_threads.get()).push_back(live);
        }

        cv.notify_one();
        assert_eq!(
            stale_context.wakeup_time_in_cycles.load(Ordering::Acquire),
            BLOCKED
        );
        assert_eq!(
            live_context.wakeup_time_in_cycles.load(Ordering::Acquire),
            0
        );
        assert!(unsafe { (*cv.blocked_threads.get()).is_empty() });
    }
}
