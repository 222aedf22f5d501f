//! x86_64 implementation of stack switching.

use std::arch::naked_asm;

/// Bytes of stack one saved register frame occupies: the six callee-saved
/// general-purpose registers of the System V AMD64 ABI.
pub const SAVED_FRAME_BYTES: usize = 48;

/// Switch stacks.
///
/// Pushes the callee-saved registers and the implicit return address onto
/// the current stack, stores the resulting stack pointer through `save`,
/// installs `target` as the stack pointer, pops the frame found there and
/// returns into the target continuation. Control comes back to the caller
/// when another switch targets the pointer written through `save`.
///
/// No heap allocation, no scheduling; this is the whole primitive.
///
/// # Safety
/// `save` must be valid for a write. `target` must be a stack pointer
/// previously written by this function or produced by [`prime_stack`].
#[unsafe(naked)]
pub unsafe extern "C" fn swap_context(_save: *mut *mut u8, _target: *mut u8) {
    naked_asm!(
        // The call that got us here already pushed the return address.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Publish the suspended stack (rdi = save).
        "mov [rdi], rsp",
        // Adopt the target stack (rsi = target).
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        // For a primed stack this lands at the trampoline entry; for a
        // suspended one, back at its swap_context call site.
        "ret",
    );
}

/// Lay out a register frame on a fresh stack so the first switch-in `ret`s
/// straight into `entry`.
///
/// Returns the stack pointer to record for the slot. The System V ABI
/// wants rsp at 16n+8 on function entry, so the frame is placed with the
/// return address on a 16-byte boundary.
///
/// # Safety
/// `stack_top` must be the one-past-the-end address of a writable region
/// of at least `SAVED_FRAME_BYTES + 16` bytes.
pub unsafe fn prime_stack(stack_top: *mut u8, entry: extern "C" fn() -> !) -> *mut u8 {
    let top = (stack_top as usize) & !0xF;
    let ret_slot = top - 16;
    let sp = ret_slot - SAVED_FRAME_BYTES;
    unsafe {
        std::ptr::write(ret_slot as *mut u64, entry as usize as u64);
        std::ptr::write_bytes(sp as *mut u8, 0, SAVED_FRAME_BYTES);
    }
    sp as *mut u8
}
