//! Cooperative M:N user-space threading.
//!
//! Many lightweight tasks are multiplexed over a fixed pool of kernel
//! threads, one pinned per CPU. Each core cooperatively schedules up to 56
//! tasks by swapping user stacks directly, with no kernel involvement;
//! cross-core coordination goes through one atomic occupancy word per core
//! and one wakeup word per task slot. Placement uses power-of-two-choices
//! sampling, so creation needs two probes instead of a scan.
//!
//! Tasks run until they return or call one of the suspension points
//! ([`yield_now`], [`sleep`], [`block`], [`dispatch`],
//! [`ConditionVariable::wait`], [`join`]); there is no preemption, and a
//! task never migrates off the core it was created on.
//!
//! # Example
//!
//! ```no_run
//! use filament::{Config, create_thread, init, join, shut_down, wait_for_termination};
//!
//! init(Config::default()).unwrap();
//!
//! let id = create_thread(|| {
//!     println!("hello from a task");
//! })
//! .expect("a slot is free");
//! join(id);
//!
//! shut_down();
//! wait_for_termination();
//! ```

mod arch;
mod context;
mod cycles;
mod occupancy;
mod runtime;
mod sched;
mod spawn;
mod sync;

pub use context::{CACHE_LINE_SIZE, MAX_TASK_BYTES, NULL_THREAD, ThreadId};
pub use occupancy::{MAX_THREADS_PER_CORE, MaskAndCount};
pub use runtime::{Config, Error, core_load, init, num_cores, shut_down, wait_for_termination};
pub use sched::{
    block, current_core_id, current_thread_id, dispatch, join, signal, sleep, yield_now,
};
pub use spawn::{create_thread, create_thread_on_core};
pub use sync::{ConditionVariable, SpinLock};

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::{Mutex, MutexGuard};

    // Tests that bring the global runtime up and down, or that consume the
    // process-wide RNG, run one at a time.
    static SERIAL: Mutex<()> = Mutex::new(());

    pub(crate) fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
