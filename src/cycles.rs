//! Cycle-counter timing source.
//!
//! Wakeup deadlines are raw readings of the per-CPU cycle counter (`rdtsc`
//! on x86_64, `cntvct_el0` on aarch64) so the dispatcher can compare a
//! single u64 against the counter on every scan. The cycles-per-nanosecond
//! ratio is fixed once at init: aarch64 advertises its timer frequency in a
//! register, x86_64 is measured against the OS clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cycles per nanosecond, stored as f64 bits. Zero until calibrated.
static CYCLES_PER_NS: AtomicU64 = AtomicU64::new(0);

/// Read the cycle counter.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn now() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Read the cycle counter.
#[cfg(target_arch = "aarch64")]
#[inline]
pub fn now() -> u64 {
    let cycles: u64;
    unsafe {
        std::arch::asm!(
            "mrs {}, cntvct_el0",
            out(reg) cycles,
            options(nomem, nostack, preserves_flags)
        );
    }
    cycles
}

/// Fix the cycles-per-nanosecond ratio. Called once from init; later calls
/// return immediately.
pub fn calibrate() {
    if CYCLES_PER_NS.load(Ordering::Acquire) != 0 {
        return;
    }
    CYCLES_PER_NS.store(measure_frequency().to_bits(), Ordering::Release);
}

#[cfg(target_arch = "aarch64")]
fn measure_frequency() -> f64 {
    // The architected timer reports its own frequency.
    let freq: u64;
    unsafe {
        std::arch::asm!(
            "mrs {}, cntfrq_el0",
            out(reg) freq,
            options(nomem, nostack, preserves_flags)
        );
    }
    freq as f64 / 1e9
}

#[cfg(target_arch = "x86_64")]
fn measure_frequency() -> f64 {
    use std::time::Instant;

    // No architected frequency register; measure the TSC against the OS
    // clock over a short busy window.
    let wall_start = Instant::now();
    let tsc_start = now();
    while wall_start.elapsed() < Duration::from_millis(10) {
        std::hint::spin_loop();
    }
    let elapsed = wall_start.elapsed();
    let ticks = now().wrapping_sub(tsc_start);
    ticks as f64 / elapsed.as_nanos() as f64
}

/// Convert a duration to cycle ticks. `calibrate` must have run.
pub fn from_duration(duration: Duration) -> u64 {
    let ratio = f64::from_bits(CYCLES_PER_NS.load(Ordering::Acquire));
    debug_assert!(ratio > 0.0, "cycles::calibrate has not run");
    (duration.as_nanos() as f64 * ratio) as u64
}
