//! Architecture-specific stack switching primitives.
//!
//! Each backend provides `swap_context` (save the callee-saved registers on
//! the current stack, publish the suspended stack pointer, resume another)
//! and `prime_stack` (lay out a fresh stack so its first switch-in lands at
//! a chosen entry point), plus the frame-size constant the two share.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::*;
