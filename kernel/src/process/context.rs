//! Process Context
//!
//! The trap frame captured at every user→kernel transition, and the
//! per-process record of the most recent one.

use crate::config::{
    EFLAGS_IF, EFLAGS_RESERVED, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR,
    USER_DATA_SELECTOR,
};
use crate::memory::VirtAddr;

/// i386 register snapshot, in the order the trap stub pushes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Regs {
    /// Faulting address for page faults
    pub cr2: u32,
    /// Data segment
    pub ds: u32,
    pub ebp: u32,
    pub edi: u32,
    pub esi: u32,
    pub edx: u32,
    pub ecx: u32,
    pub ebx: u32,
    pub eax: u32,
    /// Instruction pointer
    pub eip: u32,
    /// Code segment
    pub cs: u32,
    pub eflags: u32,
    /// Stack pointer
    pub esp: u32,
    /// Stack segment
    pub ss: u32,
}

impl Regs {
    /// Number of 32-bit words in the frame.
    pub const WORDS: usize = 14;

    /// Size of the frame in bytes.
    pub const SIZE: usize = Self::WORDS * 4;

    /// Context for entering user mode at `entry` with stack `esp`.
    pub fn user_entry(entry: VirtAddr, esp: VirtAddr) -> Self {
        Regs {
            ds: USER_DATA_SELECTOR,
            eip: entry,
            cs: USER_CODE_SELECTOR,
            eflags: EFLAGS_IF | EFLAGS_RESERVED,
            esp,
            ss: USER_DATA_SELECTOR,
            ..Regs::default()
        }
    }

    /// Context of a trap taken in kernel mode.
    pub fn kernel() -> Self {
        Regs {
            ds: KERNEL_DATA_SELECTOR,
            cs: KERNEL_CODE_SELECTOR,
            eflags: EFLAGS_RESERVED,
            ss: KERNEL_DATA_SELECTOR,
            ..Regs::default()
        }
    }

    /// Whether the trap came from ring 3.
    pub fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Force ring 3 selectors so a restored frame cannot gain privilege.
    pub fn sanitized(mut self) -> Self {
        self.cs |= 3;
        self.ss |= 3;
        self.ds |= 3;
        self
    }

    pub fn to_words(&self) -> [u32; Self::WORDS] {
        [
            self.cr2, self.ds, self.ebp, self.edi, self.esi, self.edx, self.ecx, self.ebx,
            self.eax, self.eip, self.cs, self.eflags, self.esp, self.ss,
        ]
    }

    pub fn from_words(w: &[u32; Self::WORDS]) -> Self {
        Regs {
            cr2: w[0],
            ds: w[1],
            ebp: w[2],
            edi: w[3],
            esi: w[4],
            edx: w[5],
            ecx: w[6],
            ebx: w[7],
            eax: w[8],
            eip: w[9],
            cs: w[10],
            eflags: w[11],
            esp: w[12],
            ss: w[13],
        }
    }
}

/// How the process last entered the kernel from user mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapState {
    /// Not inside a user trap.
    None,
    /// Inside a system call whose result is not yet in `eax`.
    Syscall,
    /// Inside an interrupt or fault, or a system call whose result is
    /// committed. The snapshot can be redirected.
    Interrupted,
}

/// Trapped user context of a process.
#[derive(Debug, Clone, Copy)]
pub struct UserContext {
    pub regs: Regs,
    pub state: TrapState,
}

impl UserContext {
    pub const fn new() -> Self {
        UserContext {
            regs: Regs {
                cr2: 0,
                ds: 0,
                ebp: 0,
                edi: 0,
                esi: 0,
                edx: 0,
                ecx: 0,
                ebx: 0,
                eax: 0,
                eip: 0,
                cs: 0,
                eflags: 0,
                esp: 0,
                ss: 0,
            },
            state: TrapState::None,
        }
    }

    /// Whether a signal handler frame may be built on this snapshot.
    pub fn deliverable(&self) -> bool {
        self.state == TrapState::Interrupted && self.regs.is_user()
    }
}
