//! Lock-free per-core slot accounting.
//!
//! Each core's live slots are tracked in a single atomic word: a 56-bit
//! occupancy bitmap plus its population count in the top byte. Keeping the
//! count in the same word lets the load balancer compare core loads with
//! one plain load, and lets reserve/release update both atomically.

use std::sync::atomic::{AtomicU64, Ordering};

/// Largest number of tasks simultaneously live on one core. Bounded to 56
/// so the bitmap and its population count share one machine word.
pub const MAX_THREADS_PER_CORE: usize = 56;

const OCCUPIED_MASK: u64 = (1 << MAX_THREADS_PER_CORE) - 1;
const COUNT_SHIFT: u32 = 56;
const COUNT_ONE: u64 = 1 << COUNT_SHIFT;

/// Decoded snapshot of one core's occupancy word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaskAndCount {
    /// Bit i is set exactly while slot i hosts a live task.
    pub occupied: u64,
    /// Population count of `occupied`, cached for O(1) load comparisons.
    pub num_occupied: u8,
}

/// One core's occupancy word.
pub(crate) struct Occupancy {
    word: AtomicU64,
}

impl Occupancy {
    pub(crate) const fn new() -> Self {
        Occupancy {
            word: AtomicU64::new(0),
        }
    }

    /// Reserve the lowest free slot. Returns its index, or `None` when all
    /// 56 are taken.
    ///
    /// The acquire half of the exchange pairs with the release that cleared
    /// the same bit, so a creator reusing a slot observes the departed
    /// task's final state (generation bump included).
    pub(crate) fn reserve(&self) -> Option<usize> {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let free = !current & OCCUPIED_MASK;
            if free == 0 {
                return None;
            }
            let index = free.trailing_zeros() as usize;
            let next = (current | (1 << index)) + COUNT_ONE;
            match self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(index),
                Err(observed) => current = observed,
            }
        }
    }

    /// Clear bit `index`. Called only by the owning core, once the
    /// departing task's final switch has landed back on the scheduler
    /// stack.
    pub(crate) fn release(&self, index: usize) {
        debug_assert!(index < MAX_THREADS_PER_CORE);
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            debug_assert!(current & (1 << index) != 0, "releasing a free slot");
            let next = (current & !(1 << index)) - COUNT_ONE;
            match self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Plain snapshot, used by the load balancer.
    pub(crate) fn load(&self) -> MaskAndCount {
        let word = self.word.load(Ordering::Relaxed);
        MaskAndCount {
            occupied: word & OCCUPIED_MASK,
            num_occupied: (word >> COUNT_SHIFT) as u8,
        }
    }
}
