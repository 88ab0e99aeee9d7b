//! User → kernel transitions.
//!
//! Every trap snapshots the hardware frame into the process's user
//! context, runs the handler and, on the way out, checks for kills and
//! pending signals before copying the (possibly redirected) snapshot
//! back into the frame.

use crate::memory::{classify_fault, FaultRegion, VirtAddr};
use crate::error::KernelError;
use crate::process::{Regs, Signal, TrapState};
use crate::scheduler::Kernel;
use crate::syscall::{self, SyscallReturn};

impl Kernel {
    fn enter_trap(&self, regs: &Regs, state: TrapState) {
        let me = self.running();
        let mut user = me.user.lock();
        user.regs = *regs;
        user.state = state;
    }

    fn leave_trap(&self, regs: &mut Regs) {
        self.check_killed();
        self.check_signals();
        let me = self.running();
        let mut user = me.user.lock();
        *regs = user.regs;
        user.state = TrapState::None;
    }

    /// `int 0x64`: the number is in `eax`, arguments in `ebx`, `ecx`
    /// and `edx`. The result replaces `eax`.
    pub fn syscall(&self, regs: &mut Regs) {
        self.enter_trap(regs, TrapState::Syscall);
        let number = regs.eax;
        let args = [regs.ebx, regs.ecx, regs.edx];
        let result = syscall::dispatch(self, number, args);
        {
            let me = self.running();
            let mut user = me.user.lock();
            if let SyscallReturn::Value(value) = result {
                user.regs.eax = value as u32;
            }
            user.state = TrapState::Interrupted;
        }
        self.leave_trap(regs);
    }

    /// Timer interrupt taken in user mode.
    pub fn trap_timer(&self, regs: &mut Regs) {
        self.enter_trap(regs, TrapState::Interrupted);
        self.timer_interrupt();
        self.leave_trap(regs);
    }

    /// Page fault taken in user mode at `va`.
    pub fn trap_page_fault(&self, regs: &mut Regs, va: VirtAddr) {
        regs.cr2 = va;
        self.enter_trap(regs, TrapState::Interrupted);
        self.handle_page_fault(va);
        self.leave_trap(regs);
    }

    /// Apply the fault policy of the region containing `va`.
    pub fn handle_page_fault(&self, va: VirtAddr) {
        let me = self.running();
        match classify_fault(va) {
            FaultRegion::NullGuard => {
                log::warn!("{}: null pointer access at {:#010x}", me, va);
                self.kill(me, KernelError::PageFault.code());
            }
            FaultRegion::KernelWindow => {
                panic!("{}: page fault at {:#010x} in the kernel window", me, va);
            }
            FaultRegion::MmapWindow => {
                log::debug!("{}: unmapped access at {:#010x}", me, va);
                self.raise_fault_signal(me, Signal::Segv);
            }
            FaultRegion::Growable => {
                let frame = me.address_space.map_fresh(va);
                log::trace!("{}: mapped {:#010x} → frame {:#x}", me, va, frame);
            }
        }
    }
}
