//! Signal Handling
//!
//! A small fixed signal set with queued, non-coalescing FIFO delivery.
//! Signals are posted to a process's queue and consumed only on that
//! process's own return path to user mode, where a handler frame is
//! built on the user stack (see [`crate::process::frame`]).

use alloc::collections::VecDeque;
use core::fmt;
use core::sync::atomic::Ordering;

use crate::config::{EFLAGS_IF, USER_MMAP_BASE, USER_STACK_TOP};
use crate::error::{KernelError, KernelResult};
use crate::memory::VirtAddr;
use crate::process::context::Regs;
use crate::process::frame::SignalFrame;
use crate::process::Process;
use crate::scheduler::Kernel;

// ─── Signal numbers ─────────────────────────────────────────────────

/// Supported signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Signal {
    Int = 2,
    Kill = 9,
    Segv = 11,
    Alrm = 14,
    Chld = 17,
}

/// Size of the per-process disposition table.
pub const NSIG: usize = 18;

impl Signal {
    pub fn from_number(n: u32) -> Option<Signal> {
        match n {
            2 => Some(Signal::Int),
            9 => Some(Signal::Kill),
            11 => Some(Signal::Segv),
            14 => Some(Signal::Alrm),
            17 => Some(Signal::Chld),
            _ => None,
        }
    }

    pub fn number(self) -> u32 {
        self as u32
    }

    /// What happens when no disposition was installed.
    pub fn default_disposition(self) -> Disposition {
        match self {
            Signal::Chld => Disposition::Ignore,
            _ => Disposition::Exit,
        }
    }

    /// Whether user code may change the disposition.
    pub fn is_catchable(self) -> bool {
        self != Signal::Kill
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Int => "SIGINT",
            Signal::Kill => "SIGKILL",
            Signal::Segv => "SIGSEGV",
            Signal::Alrm => "SIGALRM",
            Signal::Chld => "SIGCHLD",
        };
        f.write_str(name)
    }
}

// ─── Signal action disposition ──────────────────────────────────────

/// `signal()` action value: ignore.
pub const ACTION_IGNORE: u32 = 0;
/// `signal()` action value: restore the default.
pub const ACTION_DEFAULT: u32 = 1;
/// `signal()` action value: terminate with the signal number.
pub const ACTION_EXIT: u32 = 2;
/// `signal()` action values at or above this are handler addresses.
pub const ACTION_HANDLER_MIN: u32 = 4;

/// Per-signal action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ignore,
    /// Terminate with the signal number as exit code.
    Exit,
    /// Run the user handler at this address.
    Handle(VirtAddr),
}

impl Disposition {
    /// Decode a `signal()` action argument for `signal`.
    pub fn decode(signal: Signal, raw: u32) -> KernelResult<Disposition> {
        match raw {
            ACTION_IGNORE => Ok(Disposition::Ignore),
            ACTION_DEFAULT => Ok(signal.default_disposition()),
            ACTION_EXIT => Ok(Disposition::Exit),
            addr if addr >= ACTION_HANDLER_MIN => {
                if (USER_MMAP_BASE..USER_STACK_TOP).contains(&addr) {
                    Ok(Disposition::Handle(addr))
                } else {
                    Err(KernelError::NotPossible)
                }
            }
            _ => Err(KernelError::NotPossible),
        }
    }
}

/// Per-process signal state.
#[derive(Debug, Clone)]
pub struct SignalState {
    /// Pending signals, oldest first.
    queue: VecDeque<Signal>,
    /// Disposition table (index = signal number).
    actions: [Disposition; NSIG],
    /// Address of the handler frame currently in use.
    frame: Option<VirtAddr>,
}

impl SignalState {
    pub fn new() -> Self {
        let mut actions = [Disposition::Exit; NSIG];
        actions[Signal::Chld.number() as usize] = Disposition::Ignore;
        SignalState {
            queue: VecDeque::new(),
            actions,
            frame: None,
        }
    }

    /// Queue a signal behind those already pending.
    pub fn post(&mut self, signal: Signal) {
        self.queue.push_back(signal);
    }

    /// Queue a synchronous signal ahead of everything pending.
    pub fn post_front(&mut self, signal: Signal) {
        self.queue.push_front(signal);
    }

    pub fn pop(&mut self) -> Option<Signal> {
        self.queue.pop_front()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn action(&self, signal: Signal) -> Disposition {
        self.actions[signal.number() as usize]
    }

    /// Install a disposition. SIGKILL cannot be changed.
    pub fn set_action(&mut self, signal: Signal, action: Disposition) -> KernelResult<Disposition> {
        if !signal.is_catchable() {
            return Err(KernelError::NotPossible);
        }
        let slot = &mut self.actions[signal.number() as usize];
        let old = *slot;
        *slot = action;
        Ok(old)
    }

    /// Reset installed handlers to the default action (used by execv).
    ///
    /// Ignored signals stay ignored.
    pub fn reset_handlers(&mut self) {
        for n in 0..NSIG {
            if let Disposition::Handle(_) = self.actions[n] {
                self.actions[n] = Signal::from_number(n as u32)
                    .map(Signal::default_disposition)
                    .unwrap_or(Disposition::Exit);
            }
        }
        self.frame = None;
    }

    /// Copy of the disposition table for a forked child.
    pub fn inherit(&self) -> SignalState {
        SignalState {
            queue: VecDeque::new(),
            actions: self.actions,
            frame: None,
        }
    }

    pub(crate) fn begin_frame(&mut self, frame: VirtAddr) {
        self.frame = Some(frame);
    }

    pub(crate) fn take_frame(&mut self) -> Option<VirtAddr> {
        self.frame.take()
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Delivery ───────────────────────────────────────────────────────

impl Kernel {
    /// Post `signal` to `target`.
    ///
    /// SIGKILL bypasses the queue and requests termination directly.
    pub fn signal(&self, target: &Process, signal: Signal) {
        self.disable();
        if signal == Signal::Kill {
            target.request_kill(Signal::Kill.number() as i64);
        } else {
            target.signals.lock().post(signal);
        }
        self.enable();
        log::debug!("{} posted to {}", signal, target);
    }

    /// Change the current process's disposition for `signal`.
    pub fn set_signal_action(&self, signal: Signal, action: Disposition) -> KernelResult<Disposition> {
        let me = self.running();
        self.disable();
        let result = me.signals.lock().set_action(signal, action);
        self.enable();
        result
    }

    /// Deliver pending signals to the current process.
    ///
    /// Does nothing unless the trapped context is a deliverable user
    /// snapshot and no handler is already running. Stops after the first
    /// handler frame is installed.
    pub fn check_signals(&self) {
        let Some(me) = self.me() else { return };
        loop {
            if me.in_signal.load(Ordering::Acquire) {
                return;
            }
            let deliverable = me.user.lock().deliverable();
            if !deliverable {
                return;
            }
            self.disable();
            let next = me.signals.lock().pop();
            self.enable();
            let Some(signal) = next else { return };
            self.do_signal(me, signal);
            self.check_killed();
        }
    }

    fn do_signal(&self, me: &Process, signal: Signal) {
        let action = me.signals.lock().action(signal);
        match action {
            Disposition::Ignore => log::trace!("{} ignored by {}", signal, me),
            Disposition::Exit => self.kill(me, signal.number() as i64),
            Disposition::Handle(handler) => {
                if let Err(err) = self.install_handler(me, signal, handler) {
                    log::warn!("{}: cannot build {} frame: {}", me, signal, err);
                    self.kill(me, KernelError::PageFault.code());
                }
            }
        }
    }

    /// Write the jumper and frame to the user stack and redirect the
    /// trapped context into `handler`.
    fn install_handler(&self, me: &Process, signal: Signal, handler: VirtAddr) -> KernelResult<()> {
        let mut user = me.user.lock();
        let (frame, sp, image) = SignalFrame::build(&user.regs, signal)?;
        me.address_space.copy_out(sp, &image)?;
        user.regs.eip = handler;
        user.regs.esp = frame;
        user.regs.eflags |= EFLAGS_IF;
        me.signals.lock().begin_frame(frame);
        me.in_signal.store(true, Ordering::Release);
        log::debug!("{}: {} → handler {:#010x}, frame {:#010x}", me, signal, handler, frame);
        Ok(())
    }

    /// Return from a signal handler: restore the saved registers.
    pub fn sigreturn(&self) -> KernelResult<()> {
        let me = self.running();
        let frame = me.signals.lock().take_frame().ok_or(KernelError::NotPossible)?;
        let mut bytes = [0u8; SignalFrame::SIZE];
        if let Err(err) = me.address_space.copy_in(frame, &mut bytes) {
            log::warn!("{}: signal frame at {:#010x} unreadable", me, frame);
            self.kill(me, KernelError::PageFault.code());
            return Err(err);
        }
        let saved: Regs = SignalFrame::decode(&bytes).regs.sanitized();
        me.user.lock().regs = saved;
        me.in_signal.store(false, Ordering::Release);
        Ok(())
    }

    /// Queue a synchronous fault signal, or kill the process if it
    /// faulted inside its own handler.
    pub(crate) fn raise_fault_signal(&self, me: &Process, signal: Signal) {
        if me.in_signal.load(Ordering::Acquire) {
            log::warn!("{}: {} inside a signal handler", me, signal);
            self.kill(me, KernelError::PageFault.code());
            return;
        }
        self.disable();
        me.signals.lock().post_front(signal);
        self.enable();
    }
}
