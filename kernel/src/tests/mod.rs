//! Kernel Scenario Tests
//!
//! Whole-kernel scenarios on the simulated machine. Each test adopts its
//! own thread as the boot process and drives kernel or user processes
//! from there.
//!
//! Assertions only run on the boot stack. User routines report what they
//! observed through exit codes or shared buffers.

mod memory_tests;
mod scheduler_tests;
mod syscall_tests;

use alloc::sync::Arc;

use crate::config::KernelConfig;
use crate::hal::SimMachine;
use crate::memory::VirtAddr;
use crate::process::{Process, Regs};
use crate::scheduler::Kernel;
use crate::syscall::SyscallNumber;

/// Entry point of the first user routine in a test.
pub(crate) const CODE: VirtAddr = 0x8000_0000;

/// Signal handler routine.
pub(crate) const HANDLER: VirtAddr = 0x8000_0400;

/// Scratch data in the growable image region.
pub(crate) const DATA: VirtAddr = 0x8000_2000;

pub(crate) struct Harness {
    pub kernel: Arc<Kernel>,
    pub machine: Arc<SimMachine>,
    pub boot: Arc<Process>,
}

pub(crate) fn boot_with(config: KernelConfig) -> Harness {
    let machine = Arc::new(SimMachine::new());
    let kernel = Kernel::new(config, machine.clone()).expect("valid config");
    let boot = kernel.adopt_boot_context("boot");
    Harness { kernel, machine, boot }
}

pub(crate) fn boot() -> Harness {
    boot_with(KernelConfig::default())
}

/// Issue a system call from a user routine.
pub(crate) fn sys(machine: &SimMachine, kernel: &Kernel, regs: &mut Regs, call: SyscallNumber, args: [u32; 3]) -> i32 {
    machine.syscall(kernel, regs, call as u32, args)
}
