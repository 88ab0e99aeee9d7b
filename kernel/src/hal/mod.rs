//! Hardware Abstraction Layer
//!
//! Everything the kernel core needs from the CPU and its devices. A real
//! port implements [`Machine`] over the interrupt flag, CR3, the TSS, the
//! PIT and the serial console; [`sim::SimMachine`] simulates them.

pub mod sim;

use crate::memory::PhysAddr;
use crate::process::Regs;
use crate::scheduler::Kernel;

pub use sim::SimMachine;

pub trait Machine {
    /// Set or clear the CPU interrupt-enable flag.
    fn set_interrupts(&self, enabled: bool);

    fn interrupts_enabled(&self) -> bool;

    /// Wait for the next interrupt. Returns `true` when that interrupt
    /// was the timer and the caller must run the timer path itself.
    fn halt(&self) -> bool;

    /// Install a page directory (CR3).
    fn load_page_directory(&self, directory: PhysAddr);

    /// Kernel stack used on the next ring 3 → ring 0 transition (TSS esp0).
    fn set_kernel_stack(&self, top: usize);

    fn console_write(&self, byte: u8);

    fn console_read(&self) -> Option<u8>;

    /// Run the current process in user mode from `regs` until it stops
    /// returning to the kernel, and report its exit status.
    fn enter_user(&self, kernel: &Kernel, regs: &mut Regs) -> i64;

    /// Power off.
    fn shutdown(&self) -> !;
}
