//! Per-core cooperative dispatcher.
//!
//! Each core runs one pinned kernel thread whose outer loop scans the
//! core's 56 slots round-robin and stack-switches into any slot whose
//! wakeup deadline has passed. Tasks hand control back by rewriting their
//! own wakeup word and switching to the distinguished scheduler context,
//! whose stack is the kernel thread's own. The loop spins when nothing is
//! runnable; it never sleeps the kernel thread.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::debug;

use crate::arch;
use crate::context::{BLOCKED, NULL_THREAD, ThreadContext, ThreadId, UNOCCUPIED};
use crate::cycles;
use crate::occupancy::MAX_THREADS_PER_CORE;
use crate::runtime::RuntimeShared;
use crate::sync::SpinLock;

thread_local! {
    /// Scheduler state of the core hosting this kernel thread, if any.
    static CORE: Cell<*const CoreRuntime> = const { Cell::new(ptr::null()) };
    static CORE_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Per-core scheduler state.
///
/// Only the owning core touches `scheduler_sp` and `loaded_context`;
/// creators on other cores reach the contexts solely through the
/// publication protocol on each slot's wakeup word.
pub(crate) struct CoreRuntime {
    pub(crate) contexts: Box<[ThreadContext]>,
    /// Saved stack pointer of the scheduler context while a task runs.
    scheduler_sp: Cell<*mut u8>,
    /// Context currently executing on this core; null in the scheduler.
    loaded_context: Cell<*const ThreadContext>,
}

unsafe impl Send for CoreRuntime {}
unsafe impl Sync for CoreRuntime {}

impl CoreRuntime {
    pub(crate) fn new() -> Self {
        let contexts: Box<[ThreadContext]> = (0..MAX_THREADS_PER_CORE)
            .map(|index| ThreadContext::new(index as u8))
            .collect();
        // Pre-prime every slot stack so its first switch-in lands at the
        // trampoline entry.
        for context in &contexts {
            unsafe { *context.sp.get() = arch::prime_stack(context.stack.top(), task_trampoline) };
        }
        CoreRuntime {
            contexts,
            scheduler_sp: Cell::new(ptr::null_mut()),
            loaded_context: Cell::new(ptr::null()),
        }
    }
}

fn current_core() -> Option<&'static CoreRuntime> {
    let core = CORE.get();
    if core.is_null() {
        None
    } else {
        Some(unsafe { &*core })
    }
}

fn loaded() -> Option<&'static ThreadContext> {
    let context = current_core()?.loaded_context.get();
    if context.is_null() {
        None
    } else {
        Some(unsafe { &*context })
    }
}

/// Index of the core hosting the calling thread, if it is a dispatcher
/// thread or a task running on one.
pub fn current_core_id() -> Option<usize> {
    CORE_ID.get()
}

/// Outer scheduler loop for one core. Runs for the life of the pinned
/// kernel thread.
pub(crate) fn core_main(shared: &'static RuntimeShared, core_id: usize) {
    let core = &shared.cores[core_id];
    CORE.set(core as *const CoreRuntime);
    CORE_ID.set(Some(core_id));
    debug!(core = core_id, "dispatcher running");

    let occupancy = &shared.occupancy[core_id];
    let slots = core.contexts.len();
    let mut cursor = 0usize;
    'scan: loop {
        let now = cycles::now();
        for step in 0..slots {
            let index = (cursor + step) % slots;
            let context = &core.contexts[index];
            // Acquire pairs with the creator's release of wakeup = 0
            // (publishing the closure bytes) and with wakes of blocked
            // tasks (publishing the writes made before the wake).
            if context.wakeup_time_in_cycles.load(Ordering::Acquire) > now {
                continue;
            }
            core.loaded_context.set(context);
            unsafe { arch::swap_context(core.scheduler_sp.as_ptr(), *context.sp.get()) };
            core.loaded_context.set(ptr::null());
            // The slot went unoccupied: its task terminated during this
            // run. Clearing the bit only now, with the departing stack
            // quiescent, keeps creators off the slot until it is safe to
            // reuse.
            if context.wakeup_time_in_cycles.load(Ordering::Relaxed) == UNOCCUPIED {
                occupancy.release(context.id_in_core as usize);
            }
            cursor = index + 1;
            continue 'scan;
        }
        // Nothing runnable this pass.
        if shared.shutdown_requested() {
            break;
        }
        std::hint::spin_loop();
    }

    CORE.set(ptr::null());
    CORE_ID.set(None);
    debug!(core = core_id, "dispatcher stopped");
}

/// First-switch-in entry for every slot stack.
///
/// Loops for the life of the slot: run the closure the creator placed in
/// the slot, run the termination protocol, hand the stack back to the
/// scheduler, and wait to be switched in again once the slot is reused.
extern "C" fn task_trampoline() -> ! {
    loop {
        let core = current_core().expect("trampoline outside a dispatcher thread");
        let context = unsafe { &*core.loaded_context.get() };
        unsafe { (*context.invocation.get()).invoke() };

        // Termination. The generation bump happens under the join lock,
        // before the notify, so a joiner re-checking after its wakeup
        // always observes the new generation.
        context.join_lock.lock();
        context.generation.fetch_add(1, Ordering::Release);
        context.join_cv.notify_all();
        context.join_lock.unlock();

        // Park the slot. The occupancy bit stays set until the scheduler
        // observes this sentinel after the switch below lands.
        context
            .wakeup_time_in_cycles
            .store(UNOCCUPIED, Ordering::Release);

        unsafe { arch::swap_context(context.sp.get(), core.scheduler_sp.get()) };
        // Resumed: the slot was reused and a fresh closure is in place.
    }
}

/// Suspend the current task and resume the scheduler's scan.
///
/// This is the only suspension point user code observes; the task resumes
/// when its wakeup deadline next passes. Callers that do not rewrite their
/// wakeup word first (left at 0) are rescheduled on a later pass. Off-task
/// callers return immediately.
pub fn dispatch() {
    let Some(core) = current_core() else {
        return;
    };
    let context = core.loaded_context.get();
    if context.is_null() {
        return;
    }
    unsafe { arch::swap_context((*context).sp.get(), core.scheduler_sp.get()) };
}

/// Cooperatively reschedule: stay runnable, but let every other ready task
/// on this core run first.
pub fn yield_now() {
    if let Some(context) = loaded() {
        context.wakeup_time_in_cycles.store(0, Ordering::Relaxed);
        dispatch();
    }
}

/// Suspend the current task for at least `duration`.
///
/// The deadline is a cycle count; the dispatcher re-runs the task on its
/// first scan after the counter passes it.
pub fn sleep(duration: Duration) {
    if let Some(context) = loaded() {
        let deadline = cycles::now() + cycles::from_duration(duration);
        context
            .wakeup_time_in_cycles
            .store(deadline, Ordering::Relaxed);
        dispatch();
    }
}

/// Publish the blocked sentinel and suspend. The task runs again once a
/// peer passes its handle to [`signal`] (or notifies a condition variable
/// it is queued on).
pub fn block() {
    if let Some(context) = loaded() {
        context
            .wakeup_time_in_cycles
            .store(BLOCKED, Ordering::Release);
        dispatch();
    }
}

/// Enqueue-side half of `ConditionVariable::wait`: publish the blocked
/// sentinel, release the caller's lock, then suspend.
pub(crate) fn block_and_release(lock: &SpinLock) {
    let Some(context) = loaded() else {
        lock.unlock();
        return;
    };
    context
        .wakeup_time_in_cycles
        .store(BLOCKED, Ordering::Release);
    lock.unlock();
    dispatch();
}

/// Handle for the calling task, or [`NULL_THREAD`] off-task.
pub fn current_thread_id() -> ThreadId {
    match loaded() {
        Some(context) => ThreadId::new(context, context.generation.load(Ordering::Relaxed)),
        None => NULL_THREAD,
    }
}

/// Make `id`'s task runnable if it is still the live occupant of its slot
/// and currently blocked. Returns whether a wake was delivered.
///
/// The conditional exchange keeps a stale handle from resurrecting a slot
/// that emptied between the generation check and the store, and coalesces
/// back-to-back wakes: the word is already 0 after the first, so the
/// second is a no-op.
pub(crate) fn wake(id: ThreadId) -> bool {
    if id.is_null() {
        return false;
    }
    let context = unsafe { &*id.context };
    if context.generation.load(Ordering::Acquire) != id.generation {
        return false;
    }
    context
        .wakeup_time_in_cycles
        .compare_exchange(BLOCKED, 0, Ordering::Release, Ordering::Relaxed)
        .is_ok()
}

/// Wake a peer that blocked itself via [`block`].
///
/// No-op when the handle is stale (the task already finished) or the peer
/// is not blocked. Safe across cores: the release exchange pairs with the
/// dispatcher's acquire load, so writes made before `signal` are visible
/// to the resumed task.
pub fn signal(id: ThreadId) {
    wake(id);
}

/// Block until the task behind `id` has finished.
///
/// Returns immediately when the handle no longer names a live task.
/// Multiple joiners are allowed; all are woken by the termination
/// protocol. From a task this blocks cooperatively; kernel-thread callers
/// (the embedder's main thread) have no context to block, so they poll the
/// generation instead.
pub fn join(id: ThreadId) {
    if id.is_null() {
        return;
    }
    let context = unsafe { &*id.context };
    if loaded().is_none() {
        while context.generation.load(Ordering::Acquire) == id.generation {
            std::thread::yield_now();
        }
        return;
    }
    context.join_lock.lock();
    while context.generation.load(Ordering::Acquire) == id.generation {
        context.join_cv.wait(&context.join_lock);
    }
    context.join_lock.unlock();
}
