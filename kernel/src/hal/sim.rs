//! Simulated machine.
//!
//! Models the pieces of an i386 PC the kernel core touches: the interrupt
//! flag, CR3, TSS esp0, a console and a halt instruction that is always
//! woken by the timer. "User code" is a set of Rust routines registered at
//! user program-counter values; they access user memory through the
//! current page tables and enter the kernel through the same trap paths
//! real hardware would use.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::hal::Machine;
use crate::memory::{PhysAddr, VirtAddr};
use crate::process::frame::SIGRETURN_JUMPER;
use crate::process::Regs;
use crate::scheduler::Kernel;
use crate::syscall::SYS_SIGRETURN;

/// A piece of simulated user code.
pub type UserRoutine = Arc<dyn Fn(&Kernel, &mut Regs) -> i64>;

/// Halts allowed before the simulation assumes every process is stuck.
const DEFAULT_IDLE_LIMIT: u64 = 1_000_000;

/// Length of the `int 0x64` instruction.
const INT_INSN_LEN: u32 = 2;

pub struct SimMachine {
    interrupts: AtomicBool,
    page_directory: AtomicU32,
    kernel_stack: AtomicUsize,
    halts: AtomicU64,
    idle_limit: u64,
    console_out: Mutex<Vec<u8>>,
    console_in: Mutex<VecDeque<u8>>,
    routines: Mutex<BTreeMap<VirtAddr, UserRoutine>>,
}

impl SimMachine {
    pub fn new() -> Self {
        Self::with_idle_limit(DEFAULT_IDLE_LIMIT)
    }

    pub fn with_idle_limit(idle_limit: u64) -> Self {
        SimMachine {
            interrupts: AtomicBool::new(false),
            page_directory: AtomicU32::new(0),
            kernel_stack: AtomicUsize::new(0),
            halts: AtomicU64::new(0),
            idle_limit,
            console_out: Mutex::new(Vec::new()),
            console_in: Mutex::new(VecDeque::new()),
            routines: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register user code at program counter `pc`.
    pub fn install(&self, pc: VirtAddr, routine: impl Fn(&Kernel, &mut Regs) -> i64 + 'static) {
        self.routines.lock().insert(pc, Arc::new(routine));
    }

    pub fn console_output(&self) -> String {
        String::from_utf8_lossy(&self.console_out.lock()).into_owned()
    }

    pub fn push_input(&self, bytes: &[u8]) {
        self.console_in.lock().extend(bytes.iter().copied());
    }

    pub fn page_directory(&self) -> PhysAddr {
        self.page_directory.load(Ordering::Acquire)
    }

    pub fn kernel_stack_top(&self) -> usize {
        self.kernel_stack.load(Ordering::Acquire)
    }

    pub fn halts(&self) -> u64 {
        self.halts.load(Ordering::Acquire)
    }

    /// Execute the routine at `regs.eip`.
    pub fn run_user(&self, kernel: &Kernel, regs: &mut Regs) -> i64 {
        let routine = self.routines.lock().get(&regs.eip).cloned();
        match routine {
            Some(routine) => routine(kernel, regs),
            None => {
                log::warn!("no user code at {:#010x}", regs.eip);
                KernelError::BadExecutable.code()
            }
        }
    }

    /// Issue `int 0x64` with `number` and up to three arguments.
    /// Returns `eax` as the user would see it.
    pub fn syscall(&self, kernel: &Kernel, regs: &mut Regs, number: u32, args: [u32; 3]) -> i32 {
        regs.eax = number;
        regs.ebx = args[0];
        regs.ecx = args[1];
        regs.edx = args[2];
        regs.eip = regs.eip.wrapping_add(INT_INSN_LEN);
        kernel.syscall(regs);
        regs.eax as i32
    }

    /// A timer interrupt arriving while user code runs.
    pub fn tick(&self, kernel: &Kernel, regs: &mut Regs) {
        kernel.trap_timer(regs);
    }

    /// User-mode store. Page faults go through the kernel; the store is
    /// retried after a fault that mapped the page. Fails when the fault
    /// redirected the context into a signal handler or could not be
    /// resolved.
    pub fn store(&self, kernel: &Kernel, regs: &mut Regs, va: VirtAddr, data: &[u8]) -> KernelResult<()> {
        self.with_faults(kernel, regs, |k| k.current_space().write_user(va, data))
    }

    /// User-mode load; see [`SimMachine::store`].
    pub fn load(&self, kernel: &Kernel, regs: &mut Regs, va: VirtAddr, buf: &mut [u8]) -> KernelResult<()> {
        self.with_faults(kernel, regs, |k| k.current_space().read_user(va, buf))
    }

    pub fn load_u32(&self, kernel: &Kernel, regs: &mut Regs, va: VirtAddr) -> KernelResult<u32> {
        let mut word = [0u8; 4];
        self.load(kernel, regs, va, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    pub fn store_u32(&self, kernel: &Kernel, regs: &mut Regs, va: VirtAddr, value: u32) -> KernelResult<()> {
        self.store(kernel, regs, va, &value.to_le_bytes())
    }

    fn with_faults(
        &self,
        kernel: &Kernel,
        regs: &mut Regs,
        mut access: impl FnMut(&Kernel) -> Result<(), crate::memory::PageFault>,
    ) -> KernelResult<()> {
        let mut last_fault = None;
        loop {
            let fault = match access(kernel) {
                Ok(()) => return Ok(()),
                Err(fault) => fault,
            };
            if last_fault == Some(fault.va) {
                return Err(KernelError::PageFault);
            }
            last_fault = Some(fault.va);
            let eip = regs.eip;
            kernel.trap_page_fault(regs, fault.va);
            if regs.eip != eip {
                return Err(KernelError::PageFault);
            }
        }
    }

    /// Run signal handlers until the context is back in ordinary code.
    /// Returns how many handler invocations completed.
    pub fn service_signals(&self, kernel: &Kernel, regs: &mut Regs) -> usize {
        let mut handled = 0;
        while kernel.current_in_signal() {
            self.run_user(kernel, regs);
            if let Err(err) = self.return_from_handler(kernel, regs) {
                log::warn!("handler return failed: {}", err);
                break;
            }
            handled += 1;
        }
        handled
    }

    /// `ret` out of a handler into the jumper, then execute the jumper.
    fn return_from_handler(&self, kernel: &Kernel, regs: &mut Regs) -> KernelResult<()> {
        let esp = regs.esp;
        let ret = self.load_u32(kernel, regs, esp)?;
        regs.esp = esp.wrapping_add(4);
        regs.eip = ret;

        let mut code = [0u8; SIGRETURN_JUMPER.len()];
        self.load(kernel, regs, ret, &mut code)?;
        if code != SIGRETURN_JUMPER {
            return Err(KernelError::BadAddress);
        }
        // mov eax, 0xff
        regs.eax = SYS_SIGRETURN;
        regs.eip = ret.wrapping_add(5 + INT_INSN_LEN);
        kernel.syscall(regs);
        Ok(())
    }
}

impl Default for SimMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for SimMachine {
    fn set_interrupts(&self, enabled: bool) {
        self.interrupts.store(enabled, Ordering::Release);
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::Acquire)
    }

    fn halt(&self) -> bool {
        if !self.interrupts_enabled() {
            panic!("hlt with interrupts disabled");
        }
        let halts = self.halts.fetch_add(1, Ordering::AcqRel) + 1;
        if halts > self.idle_limit {
            panic!("idle for {} halts, every process is blocked", self.idle_limit);
        }
        true
    }

    fn load_page_directory(&self, directory: PhysAddr) {
        self.page_directory.store(directory, Ordering::Release);
    }

    fn set_kernel_stack(&self, top: usize) {
        self.kernel_stack.store(top, Ordering::Release);
    }

    fn console_write(&self, byte: u8) {
        self.console_out.lock().push(byte);
    }

    fn console_read(&self) -> Option<u8> {
        self.console_in.lock().pop_front()
    }

    fn enter_user(&self, kernel: &Kernel, regs: &mut Regs) -> i64 {
        self.run_user(kernel, regs)
    }

    fn shutdown(&self) -> ! {
        panic!("machine shutdown requested");
    }
}
