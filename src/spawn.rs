//! Task creation and placement.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::context::ThreadId;
use crate::runtime::{self, RuntimeShared};

/// Create a task on a specific core.
///
/// Reserves a slot in the core's occupancy word, placement-writes the
/// closure into the slot's inline cell, and publishes it to the owning
/// core with a release store of wakeup = 0. Returns `None` when all 56
/// slots on the core are taken; there is no retry on other cores.
///
/// The closure and its captures must fit in one cache line; a larger
/// closure fails to compile.
///
/// # Panics
/// Panics if the runtime is not initialized or `core_id` is out of range.
pub fn create_thread_on_core<F>(core_id: usize, f: F) -> Option<ThreadId>
where
    F: FnOnce() + Send + 'static,
{
    let shared = runtime::shared();
    assert!(core_id < shared.num_cores(), "core index out of range");
    let Some(index) = shared.occupancy[core_id].reserve() else {
        trace!(core = core_id, "no free slot");
        return None;
    };

    let context = &shared.cores[core_id].contexts[index];
    unsafe { (*context.invocation.get()).write(f) };
    // The handle carries the generation as of creation; the release store
    // below is what lets the task run (and eventually bump it).
    let generation = context.generation.load(Ordering::Relaxed);
    context.wakeup_time_in_cycles.store(0, Ordering::Release);
    Some(ThreadId::new(context, generation))
}

/// Create a task on the less-loaded of two randomly chosen distinct cores.
///
/// Power-of-two-choices placement: two probes give an expected maximum
/// load of O(log log N) without scanning every core. Ties go to the
/// second pick. Exhaustion of the chosen core returns `None` without
/// retrying elsewhere; callers that require placement can loop over cores
/// with [`create_thread_on_core`] themselves.
pub fn create_thread<F>(f: F) -> Option<ThreadId>
where
    F: FnOnce() + Send + 'static,
{
    let shared = runtime::shared();
    create_thread_on_core(choose_core(shared), f)
}

fn choose_core(shared: &RuntimeShared) -> usize {
    let cores = shared.num_cores() as u64;
    if cores == 1 {
        return 0;
    }
    let first = (random() % cores) as usize;
    let mut second = (random() % cores) as usize;
    while second == first {
        second = (random() % cores) as usize;
    }
    if shared.occupancy[first].load().num_occupied < shared.occupancy[second].load().num_occupied {
        first
    } else {
        second
    }
}

// Marsaglia xorshift with process-wide state. Concurrent creators may race
// a step; the generator only feeds placement, so a torn sequence is
// harmless.
static RNG_X: AtomicU64 = AtomicU64::new(123456789);
static RNG_Y: AtomicU64 = AtomicU64::new(362436069);
static RNG_Z: AtomicU64 = AtomicU64::new(521288629);

pub(crate) fn random() -> u64 {
    #[cfg(test)]
    if let Some(value) = mock::pop() {
        return value;
    }

    let mut x = RNG_X.load(Ordering::Relaxed);
    let y = RNG_Y.load(Ordering::Relaxed);
    let z = RNG_Z.load(Ordering::Relaxed);
    x ^= x << 16;
    x ^= x >> 5;
    x ^= x << 1;
    let t = x;
    let next = t ^ y ^ z;
    RNG_X.store(y, Ordering::Relaxed);
    RNG_Y.store(z, Ordering::Relaxed);
    RNG_Z.store(next, Ordering::Relaxed);
    next
}
