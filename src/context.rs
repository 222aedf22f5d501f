//! Per-slot task state.
//!
//! Each core owns a fixed array of [`ThreadContext`] records. A record
//! outlives the tasks it hosts: the stack and slot state are reused, and a
//! generation counter keeps stale handles from aliasing a successor task.

use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::sync::{ConditionVariable, SpinLock};

/// Line granularity assumed for the inline closure cell and padding.
pub const CACHE_LINE_SIZE: usize = 64;

/// Fixed stack size for every task slot (64 KiB).
pub(crate) const STACK_SIZE: usize = 64 * 1024;

/// Wakeup sentinel: a live task blocked until an explicit wake.
pub(crate) const BLOCKED: u64 = u64::MAX;

/// Wakeup sentinel: no live task in this slot. Unreachable by any real
/// deadline, so the dispatcher's `wakeup <= now` test never fires on it.
pub(crate) const UNOCCUPIED: u64 = u64::MAX - 1;

type InvokeFn = unsafe fn(*mut u8);

/// Closure payload capacity: one cache line minus the invoke thunk.
pub const MAX_TASK_BYTES: usize = CACHE_LINE_SIZE - size_of::<InvokeFn>();

/// Inline, cache-line-aligned storage for a task closure.
///
/// Creation placement-writes the closure bytes and an invoke thunk here; no
/// per-task heap allocation happens. The creating core's writes become
/// visible to the owning core through the release store of the slot's
/// wakeup word and the dispatcher's acquire load of it.
#[repr(C, align(64))]
pub(crate) struct InlineInvocation {
    payload: MaybeUninit<[u8; MAX_TASK_BYTES]>,
    invoke: MaybeUninit<InvokeFn>,
}

const _: () = assert!(size_of::<InlineInvocation>() == CACHE_LINE_SIZE);

impl InlineInvocation {
    pub(crate) const fn empty() -> Self {
        InlineInvocation {
            payload: MaybeUninit::uninit(),
            invoke: MaybeUninit::uninit(),
        }
    }

    /// Placement-write `f` and its invoke thunk.
    ///
    /// The closure and its captures must fit in the payload; checked per
    /// instantiation at compile time.
    ///
    /// # Safety
    /// The caller must hold the slot reservation; nothing may read the cell
    /// until the wakeup word publishes it.
    pub(crate) unsafe fn write<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        const {
            assert!(
                size_of::<F>() <= MAX_TASK_BYTES,
                "task closure and captures must fit in one cache line"
            );
            assert!(
                align_of::<F>() <= CACHE_LINE_SIZE,
                "task closure alignment exceeds the inline cell"
            );
        }
        unsafe { (self.payload.as_mut_ptr() as *mut F).write(f) };
        self.invoke = MaybeUninit::new(invoke_closure::<F>);
    }

    /// Run the stored closure, consuming it.
    ///
    /// # Safety
    /// A closure must have been written since the slot was last reserved,
    /// and it must not have been invoked yet.
    pub(crate) unsafe fn invoke(&mut self) {
        unsafe { (self.invoke.assume_init())(self.payload.as_mut_ptr() as *mut u8) }
    }
}

unsafe fn invoke_closure<F: FnOnce()>(payload: *mut u8) {
    let f = unsafe { (payload as *mut F).read() };
    f();
}

/// Owned fixed-size stack region. Lifetime follows the core, not the task:
/// successive tasks in a slot reuse the same memory, freed only when the
/// runtime is torn down.
pub(crate) struct StackMemory {
    base: NonNull<u8>,
    layout: Layout,
}

impl StackMemory {
    pub(crate) fn new() -> Self {
        let layout = Layout::from_size_align(STACK_SIZE, 16).unwrap();
        let raw = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        StackMemory { base, layout }
    }

    /// One past the highest byte; stacks grow downward from here.
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(STACK_SIZE) }
    }
}

impl Drop for StackMemory {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

unsafe impl Send for StackMemory {}
unsafe impl Sync for StackMemory {}

/// All state for one task slot.
///
/// Field access follows a single-writer discipline: the owning core writes
/// `sp`, the wakeup word and the invocation cell, except that (a) the
/// creating core writes the invocation and then release-stores wakeup = 0
/// into a slot it has reserved, and (b) any core may flip the wakeup word
/// from `BLOCKED` to 0 through `signal` or a condition-variable notify.
pub(crate) struct ThreadContext {
    /// Stack region backing this slot.
    pub(crate) stack: StackMemory,
    /// Saved stack pointer for resuming this context.
    pub(crate) sp: UnsafeCell<*mut u8>,
    /// Cycle deadline or sentinel; the single cross-core handoff word.
    pub(crate) wakeup_time_in_cycles: AtomicU64,
    /// Bumped once per task that finishes in this slot.
    pub(crate) generation: AtomicU32,
    /// Protects and signals the joiners of the task in this slot.
    pub(crate) join_lock: SpinLock,
    pub(crate) join_cv: ConditionVariable,
    /// Bit index in the core's occupancy word. Read-only after init.
    pub(crate) id_in_core: u8,
    /// Inline closure cell.
    pub(crate) invocation: UnsafeCell<InlineInvocation>,
}

unsafe impl Send for ThreadContext {}
unsafe impl Sync for ThreadContext {}

impl ThreadContext {
    pub(crate) fn new(id_in_core: u8) -> Self {
        ThreadContext {
            stack: StackMemory::new(),
            sp: UnsafeCell::new(std::ptr::null_mut()),
            wakeup_time_in_cycles: AtomicU64::new(UNOCCUPIED),
            generation: AtomicU32::new(0),
            join_lock: SpinLock::new(),
            join_cv: ConditionVariable::new(),
            id_in_core,
            invocation: UnsafeCell::new(InlineInvocation::empty()),
        }
    }
}

/// Stable handle for one task: the slot plus the generation that was
/// current when the handle was made. A handle is live exactly while the
/// slot's generation still matches; afterwards every operation on it is a
/// no-op.
#[derive(Clone, Copy, Debug)]
pub struct ThreadId {
    pub(crate) context: *const ThreadContext,
    pub(crate) generation: u32,
}

/// Sentinel for "no thread". [`crate::join`] and [`crate::signal`] on it
/// are no-ops.
pub const NULL_THREAD: ThreadId = ThreadId {
    context: std::ptr::null(),
    generation: 0,
};

impl ThreadId {
    pub(crate) fn new(context: *const ThreadContext, generation: u32) -> Self {
        ThreadId {
            context,
            generation,
        }
    }

    /// Whether this is the null sentinel.
    pub fn is_null(self) -> bool {
        self.context.is_null()
    }
}

impl PartialEq for ThreadId {
    fn eq(&self, other: &Self) -> bool {
        self.context == other.context && self.generation == other.generation
    }
}

impl Eq for ThreadId {}

// Handles are plain (pointer, counter) pairs; every dereference re-checks
// the generation.
unsafe impl Send for ThreadId {}
unsafe impl Sync for ThreadId {}
