//! Context switch implementation.
//!
//! A suspended kernel context is nothing but a saved stack pointer: the
//! callee-saved registers and the resume address live on the context's
//! own stack. [`switch_stacks`] pushes them, stores the stack pointer,
//! loads the next one and pops them again.
//!
//! A fresh stack is seeded so that the first switch "returns" into
//! [`entry_thunk`], which calls the scheduler's process entry with the
//! kernel pointer stashed in a callee-saved register.

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use core::arch::naked_asm;
use core::ptr::NonNull;

/// Pattern written over the guard region of every kernel stack.
const STACK_CANARY: u64 = 0x5AFE_C0DE_DEAD_BEEF;

/// Stack alignment required by the calling convention.
const STACK_ALIGN: usize = 16;

// ─── Architecture primitives ────────────────────────────────────────

/// Switch from the current stack to `next`.
///
/// Pushes the callee-saved registers, stores the resulting stack pointer
/// through `save`, loads `next` and pops the registers saved there.
///
/// # Safety
///
/// - `save` must be valid for a write of one `usize`.
/// - `next` must be a stack pointer produced by an earlier switch away
///   from a context, or by [`KernelStack::seed`], whose stack is still
///   alive.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch_stacks(_save: *mut usize, _next: usize) {
    // rdi = save slot
    // rsi = next stack pointer
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// First code run on a seeded stack.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn entry_thunk() {
    naked_asm!(
        "mov rdi, r12",
        "call {entry}",
        "ud2",
        entry = sym crate::scheduler::process_entry,
    );
}

/// Words of the seeded frame, lowest address first.
#[cfg(target_arch = "x86_64")]
fn initial_frame(arg: usize) -> [usize; 7] {
    // r15 r14 r13 r12 rbx rbp return-address
    [0, 0, 0, arg, 0, 0, entry_thunk as usize]
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch_stacks(_save: *mut usize, _next: usize) {
    // x0 = save slot
    // x1 = next stack pointer
    naked_asm!(
        "sub sp, sp, #0xa0",
        "stp x19, x20, [sp, #0x00]",
        "stp x21, x22, [sp, #0x10]",
        "stp x23, x24, [sp, #0x20]",
        "stp x25, x26, [sp, #0x30]",
        "stp x27, x28, [sp, #0x40]",
        "stp x29, x30, [sp, #0x50]",
        "stp d8, d9, [sp, #0x60]",
        "stp d10, d11, [sp, #0x70]",
        "stp d12, d13, [sp, #0x80]",
        "stp d14, d15, [sp, #0x90]",
        "mov x9, sp",
        "str x9, [x0]",
        "mov sp, x1",
        "ldp x19, x20, [sp, #0x00]",
        "ldp x21, x22, [sp, #0x10]",
        "ldp x23, x24, [sp, #0x20]",
        "ldp x25, x26, [sp, #0x30]",
        "ldp x27, x28, [sp, #0x40]",
        "ldp x29, x30, [sp, #0x50]",
        "ldp d8, d9, [sp, #0x60]",
        "ldp d10, d11, [sp, #0x70]",
        "ldp d12, d13, [sp, #0x80]",
        "ldp d14, d15, [sp, #0x90]",
        "add sp, sp, #0xa0",
        "ret",
    );
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn entry_thunk() {
    naked_asm!(
        "mov x0, x19",
        "bl {entry}",
        "brk #0",
        entry = sym crate::scheduler::process_entry,
    );
}

#[cfg(target_arch = "aarch64")]
fn initial_frame(arg: usize) -> [usize; 20] {
    let mut frame = [0usize; 20];
    // x19 carries the argument, x30 is the resume address.
    frame[0] = arg;
    frame[11] = entry_thunk as usize;
    frame
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("context switching is implemented for x86_64 and aarch64 only");

// ─── Kernel stacks ──────────────────────────────────────────────────

/// Stack usage reported when a guard check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackOverflow {
    pub used: usize,
    pub size: usize,
    pub canary_intact: bool,
}

/// An owned kernel stack with a guard region at its low end.
///
/// The memory is only ever touched through raw pointers: once seeded it
/// belongs to the context running on it.
pub struct KernelStack {
    base: NonNull<u8>,
    size: usize,
    guard: usize,
}

impl KernelStack {
    pub fn new(size: usize, guard: usize) -> Self {
        assert!(size > guard + 256 && size % STACK_ALIGN == 0, "bad kernel stack size {}", size);
        let layout = Self::layout(size);
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            handle_alloc_error(layout)
        };
        let stack = KernelStack { base, size, guard };
        let words = guard / core::mem::size_of::<u64>();
        for i in 0..words {
            // SAFETY: the guard region lies inside the allocation.
            unsafe { base.as_ptr().cast::<u64>().add(i).write(STACK_CANARY) };
        }
        stack
    }

    fn layout(size: usize) -> Layout {
        match Layout::from_size_align(size, STACK_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("bad kernel stack layout for {} bytes", size),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Lowest address of the stack allocation.
    pub fn bottom(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the highest usable address, 16-byte aligned.
    pub fn top(&self) -> usize {
        self.bottom() + self.size
    }

    /// Write the initial frame and return the stack pointer to resume.
    ///
    /// The first switch to the returned stack pointer enters
    /// `process_entry(arg)`.
    pub fn seed(&mut self, arg: usize) -> usize {
        let frame = initial_frame(arg);
        let bytes = core::mem::size_of_val(&frame);
        // Leave one aligned slot above the frame so the entry call sees
        // a correctly aligned stack.
        let sp = self.top() - STACK_ALIGN - bytes;
        debug_assert!(sp >= self.bottom() + self.guard);
        // SAFETY: [sp, sp + bytes) lies inside the allocation and no
        // context runs on this stack yet.
        unsafe {
            core::ptr::copy_nonoverlapping(frame.as_ptr(), sp as *mut usize, frame.len());
        }
        sp
    }

    fn canary_intact(&self) -> bool {
        let words = self.guard / core::mem::size_of::<u64>();
        (0..words).all(|i| {
            // SAFETY: the guard region lies inside the allocation.
            unsafe { self.base.as_ptr().cast::<u64>().add(i).read_volatile() == STACK_CANARY }
        })
    }

    /// Check a saved stack pointer against the guard region.
    pub fn check(&self, sp: usize) -> Result<(), StackOverflow> {
        let used = self.top().saturating_sub(sp);
        let canary_intact = self.canary_intact();
        if sp < self.bottom() + self.guard || sp > self.top() || !canary_intact {
            return Err(StackOverflow {
                used,
                size: self.size,
                canary_intact,
            });
        }
        Ok(())
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.size)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_stack_is_aligned_and_checked() {
        let mut stack = KernelStack::new(64 * 1024, 1024);
        let sp = stack.seed(0x1234);
        assert_eq!(sp % 8, 0);
        assert!(sp < stack.top());
        assert_eq!(stack.check(sp), Ok(()));
    }

    #[test]
    fn test_guard_violation_detected() {
        let stack = KernelStack::new(64 * 1024, 1024);
        let err = stack.check(stack.bottom() + 512).unwrap_err();
        assert!(err.used > 63 * 1024);
        assert_eq!(err.size, 64 * 1024);
        assert!(err.canary_intact);
    }

    #[test]
    fn test_canary_damage_detected() {
        let stack = KernelStack::new(64 * 1024, 1024);
        // SAFETY: test owns the stack and nothing runs on it.
        unsafe { (stack.bottom() as *mut u64).add(3).write(0) };
        let err = stack.check(stack.top() - 64).unwrap_err();
        assert!(!err.canary_intact);
    }
}
