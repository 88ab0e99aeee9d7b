//! Kernel scheduler module.
//!
//! Round-robin scheduling of processes on a single CPU. Every process
//! runs on its own kernel stack; switching is a stack-pointer swap (see
//! [`context`]). Preemption happens only at the end of a timer interrupt,
//! so kernel code is never switched away from except where it blocks or
//! yields.
//!
//! All scheduler state hangs off [`Kernel`], which every component
//! receives explicitly.

pub mod context;
pub mod irq;
pub mod timer;
pub mod trap;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use crate::config::{KernelConfig, STACK_GUARD_SIZE};
use crate::error::KernelResult;
use crate::fs::FileSystem;
use crate::hal::Machine;
use crate::memory::{AddressSpace, PhysAddr, PhysMem, VirtAddr};
use crate::process::process::Entry;
use crate::process::{
    Process, ProcessId, ProcessState, Regs, ResourceTable, Signal, TrapState, UserContext,
};
use crate::sync::WaitQueue;

use context::{switch_stacks, KernelStack};
use timer::TimerRegistry;

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub context_switches: u64,
    pub processes_created: u64,
    pub processes_reaped: u64,
    pub deferred_alarms: u64,
    pub jiffies: u64,
    pub idle_jiffies: u64,
}

#[derive(Default)]
struct RunQueues {
    ready: VecDeque<Arc<Process>>,
    /// Exited processes whose last scheduler reference is still alive.
    reaper: VecDeque<Arc<Process>>,
}

/// The kernel context.
pub struct Kernel {
    config: KernelConfig,
    machine: Arc<dyn Machine>,
    memory: Arc<PhysMem>,
    kernel_table: PhysAddr,
    fs: Mutex<Option<Arc<dyn FileSystem>>>,
    queues: Mutex<RunQueues>,
    current: Mutex<Option<Arc<Process>>>,
    idle: Mutex<Option<Arc<Process>>>,
    pub(crate) timers: Mutex<TimerRegistry>,
    directory: Mutex<HashMap<ProcessId, Weak<Process>>>,
    next_pid: AtomicU32,
    booted: AtomicBool,
    pub(crate) jiffies: AtomicU64,
    pub(crate) idle_jiffies: AtomicU64,
    /// Save slot for contexts that will never be resumed.
    orphan_sp: AtomicUsize,
    switches: AtomicU64,
    created: AtomicU64,
    reaped: AtomicU64,
}

impl Kernel {
    pub fn new(config: KernelConfig, machine: Arc<dyn Machine>) -> KernelResult<Arc<Kernel>> {
        config.validate()?;
        let memory = Arc::new(PhysMem::new(config.phys_mem_size, config.phys_reserved));
        let kernel_table = AddressSpace::build_kernel_table(&memory);
        log::info!(
            "kernel: {} KiB physical memory, {} Hz timer",
            config.phys_mem_size / 1024,
            config.timer_hz
        );
        Ok(Arc::new(Kernel {
            config,
            machine,
            memory,
            kernel_table,
            fs: Mutex::new(None),
            queues: Mutex::new(RunQueues::default()),
            current: Mutex::new(None),
            idle: Mutex::new(None),
            timers: Mutex::new(TimerRegistry::new()),
            directory: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1),
            booted: AtomicBool::new(false),
            jiffies: AtomicU64::new(0),
            idle_jiffies: AtomicU64::new(0),
            orphan_sp: AtomicUsize::new(0),
            switches: AtomicU64::new(0),
            created: AtomicU64::new(0),
            reaped: AtomicU64::new(0),
        }))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn machine(&self) -> &dyn Machine {
        &*self.machine
    }

    pub fn memory(&self) -> &Arc<PhysMem> {
        &self.memory
    }

    pub fn set_filesystem(&self, fs: Arc<dyn FileSystem>) {
        *self.fs.lock() = Some(fs);
    }

    pub fn filesystem(&self) -> Option<Arc<dyn FileSystem>> {
        self.fs.lock().clone()
    }

    /// Turn the calling context into the first process.
    ///
    /// The boot context keeps running on the stack it was born on and
    /// has no stack guard.
    pub fn adopt_boot_context(&self, name: &str) -> Arc<Process> {
        if self.booted.swap(true, Ordering::AcqRel) {
            panic!("boot context adopted twice");
        }
        let id = self.alloc_pid();
        let process = Arc::new(Process::new(
            id,
            name,
            None,
            0,
            AddressSpace::new(self.memory.clone(), self.kernel_table),
            Arc::new(ResourceTable::new(self.config.resource_table_capacity)),
            None,
            None,
            false,
        ));
        process.set_state(ProcessState::Running);
        process.address_space.activate(self.machine());
        self.directory.lock().insert(id, Arc::downgrade(&process));
        self.created.fetch_add(1, Ordering::Relaxed);
        *self.current.lock() = Some(process.clone());
        self.restore_interrupt_flag(&process);
        log::info!("{}: boot context adopted", process);
        process
    }

    // ─── Current process ────────────────────────────────────────────

    /// The running process, borrowed.
    ///
    /// The reference is only used on the running process's own stack,
    /// and a process stays referenced by the current slot, a queue or
    /// the reaper for as long as its stack can run.
    pub(crate) fn me(&self) -> Option<&Process> {
        let ptr = self.current.lock().as_ref().map(Arc::as_ptr)?;
        // SAFETY: see above. The pointee lives in an `Arc` allocation
        // that outlives every activation of its own stack.
        Some(unsafe { &*ptr })
    }

    /// The running process. Panics in contexts without one.
    pub(crate) fn running(&self) -> &Process {
        match self.me() {
            Some(me) => me,
            None => panic!("no current process"),
        }
    }

    pub fn current(&self) -> Option<Arc<Process>> {
        self.current.lock().clone()
    }

    pub fn current_in_signal(&self) -> bool {
        self.me().is_some_and(Process::in_signal)
    }

    /// Address space of the running process.
    pub fn current_space(&self) -> &AddressSpace {
        &self.running().address_space
    }

    fn is_current(&self, process: &Process) -> bool {
        self.me().is_some_and(|me| core::ptr::eq(me, process))
    }

    // ─── Creation ───────────────────────────────────────────────────

    fn alloc_pid(&self) -> ProcessId {
        ProcessId(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a kernel process running `body`. It does not run until
    /// [`Kernel::start`].
    ///
    /// Without `resources` the process gets a fresh, empty table.
    pub fn create<F>(&self, name: &str, resources: Option<Arc<ResourceTable>>, body: F) -> Arc<Process>
    where
        F: FnOnce(&Kernel) -> i64 + 'static,
    {
        let parent = self.current().map(|p| Arc::downgrade(&p));
        self.spawn(name, resources, Entry::Kernel(Box::new(body)), parent)
    }

    /// Create a process that enters user mode at `entry` with stack `sp`.
    pub fn spawn_user(&self, name: &str, entry: VirtAddr, sp: VirtAddr) -> Arc<Process> {
        let parent = self.current().map(|p| Arc::downgrade(&p));
        self.spawn(name, None, Entry::User(Regs::user_entry(entry, sp)), parent)
    }

    pub(crate) fn spawn(
        &self,
        name: &str,
        resources: Option<Arc<ResourceTable>>,
        entry: Entry,
        parent: Option<Weak<Process>>,
    ) -> Arc<Process> {
        let process = self.new_process(name, resources, entry, parent, false);
        self.directory.lock().insert(process.id, Arc::downgrade(&process));
        process
    }

    fn new_process(
        &self,
        name: &str,
        resources: Option<Arc<ResourceTable>>,
        entry: Entry,
        parent: Option<Weak<Process>>,
        is_idle: bool,
    ) -> Arc<Process> {
        let id = self.alloc_pid();
        let mut stack = KernelStack::new(self.config.kernel_stack_size, STACK_GUARD_SIZE);
        let sp = stack.seed(self as *const Kernel as usize);
        let resources =
            resources.unwrap_or_else(|| Arc::new(ResourceTable::new(self.config.resource_table_capacity)));
        let process = Arc::new(Process::new(
            id,
            name,
            Some(stack),
            sp,
            AddressSpace::new(self.memory.clone(), self.kernel_table),
            resources,
            Some(entry),
            parent,
            is_idle,
        ));
        self.created.fetch_add(1, Ordering::Relaxed);
        log::debug!("created {}", process);
        process
    }

    /// The idle process, created on first use. It is never queued.
    fn idle_process(&self) -> Arc<Process> {
        let existing = self.idle.lock().clone();
        if let Some(idle) = existing {
            return idle;
        }
        let idle = self.new_process(
            "idle",
            None,
            Entry::Kernel(Box::new(|kernel: &Kernel| kernel.idle_loop())),
            None,
            true,
        );
        *self.idle.lock() = Some(idle.clone());
        idle
    }

    fn idle_loop(&self) -> ! {
        loop {
            self.check_reaper();
            if self.machine.halt() {
                self.timer_interrupt();
            }
        }
    }

    // ─── Queues ─────────────────────────────────────────────────────

    /// Make `process` runnable for the first time.
    pub fn start(&self, process: Arc<Process>) {
        self.disable();
        self.make_ready(process);
        self.enable();
    }

    /// Append `process` to the ready queue.
    pub fn make_ready(&self, process: Arc<Process>) {
        if process.is_idle || process.state() == ProcessState::Terminated {
            return;
        }
        process.set_state(ProcessState::Ready);
        self.queues.lock().ready.push_back(process);
    }

    pub fn ready_count(&self) -> usize {
        self.queues.lock().ready.len()
    }

    /// Let every other ready process run once.
    pub fn yield_now(&self) {
        self.disable();
        self.reschedule(None);
        self.enable();
    }

    /// Park the current process on `queue` until someone readies it.
    pub fn block(&self, queue: &WaitQueue) {
        self.disable();
        self.reschedule(Some(queue));
        self.enable();
    }

    /// Park the current process and dispatch the next one.
    ///
    /// Interrupts are disabled by the caller.
    fn reschedule(&self, queue: Option<&WaitQueue>) {
        let prev = self.current.lock().clone();
        match (prev, queue) {
            (Some(prev), Some(queue)) => {
                if prev.irq_depth() != 0 {
                    panic!(
                        "{} blocked inside an interrupt handler (irq depth {}, disable count {})",
                        prev,
                        prev.irq_depth(),
                        prev.disable_count()
                    );
                }
                prev.set_state(ProcessState::Blocked);
                queue.push(prev);
            }
            (Some(prev), None) => {
                if !prev.is_idle {
                    prev.set_state(ProcessState::Ready);
                    self.queues.lock().ready.push_back(prev);
                }
            }
            (None, Some(_)) => panic!("block without a current process"),
            (None, None) => {}
        }
        let next = self.pick_next();
        self.dispatch(next);
    }

    fn pick_next(&self) -> Arc<Process> {
        let next = self.queues.lock().ready.pop_front();
        match next {
            Some(next) => next,
            None => self.idle_process(),
        }
    }

    /// Switch to `next`. Returns when the caller is dispatched again.
    fn dispatch(&self, next: Arc<Process>) {
        let prev: Option<*const Process> = self.current.lock().as_ref().map(Arc::as_ptr);
        next.set_state(ProcessState::Running);
        if prev == Some(Arc::as_ptr(&next)) {
            self.after_switch();
            return;
        }

        let next_sp = next.saved_sp.load(Ordering::Acquire);
        if let Some(stack) = &next.stack {
            if let Err(overflow) = stack.check(next_sp) {
                let from = self.me().map(|p| alloc::format!("{}", p));
                panic!(
                    "kernel stack overflow switching from {} to {}: {} of {} bytes used, canary {}",
                    from.as_deref().unwrap_or("<none>"),
                    next,
                    overflow.used,
                    overflow.size,
                    if overflow.canary_intact { "intact" } else { "damaged" }
                );
            }
            self.machine.set_kernel_stack(stack.top());
        }
        next.address_space.activate(self.machine());

        let save = match prev {
            // SAFETY: the previous process was queued, parked or sent
            // to the reaper by the caller and stays alive until it has
            // switched away.
            Some(prev) => unsafe { (*prev).saved_sp.as_ptr() },
            None => self.orphan_sp.as_ptr(),
        };
        *self.current.lock() = Some(next);
        self.switches.fetch_add(1, Ordering::Relaxed);

        // SAFETY: `save` is a live slot and `next_sp` was produced by a
        // switch away from `next` or by seeding its stack.
        unsafe { switch_stacks(save, next_sp) };

        self.after_switch();
    }

    /// Work done by a context right after it is dispatched.
    fn after_switch(&self) {
        let Some(me) = self.me() else { return };
        self.restore_interrupt_flag(me);
        self.check_killed();
        if !me.in_signal() {
            self.check_signals();
        }
    }

    fn restore_interrupt_flag(&self, process: &Process) {
        self.machine.set_interrupts(process.disable_count() == 0);
    }

    /// Run the entry behavior of a freshly dispatched process.
    fn run_current(&self) -> ! {
        self.after_switch();
        let me = self.running();
        let code = match me.take_entry() {
            Some(Entry::Kernel(body)) => body(self),
            Some(Entry::User(regs)) => self.enter_user(regs),
            None => panic!("{} dispatched without an entry", me),
        };
        self.exit(code)
    }

    /// Run the current process in user mode from `regs`.
    pub fn enter_user(&self, regs: Regs) -> i64 {
        let me = self.running();
        let mut regs = regs.sanitized();
        *me.user.lock() = UserContext {
            regs,
            state: TrapState::None,
        };
        self.machine.enter_user(self, &mut regs)
    }

    // ─── Termination ────────────────────────────────────────────────

    /// Request termination of `target` with `code`. The first request
    /// wins. Takes effect at the target's next kill check.
    pub fn kill(&self, target: &Process, code: i64) {
        target.request_kill(code);
        log::debug!("{} killed with {}", target, code);
        if self.is_current(target) {
            self.check_killed();
        }
    }

    /// Reap exited processes, then exit if the current process has a
    /// pending kill request.
    pub fn check_killed(&self) {
        self.check_reaper();
        let Some(me) = self.me() else { return };
        if let Some(code) = me.kill_code() {
            self.exit(code);
        }
    }

    /// Drop the scheduler's last reference to every exited process.
    pub fn check_reaper(&self) {
        self.disable();
        let drained: Vec<Arc<Process>> = self.queues.lock().reaper.drain(..).collect();
        for process in drained {
            self.directory.lock().remove(&process.id);
            self.reaped.fetch_add(1, Ordering::Relaxed);
            log::trace!("reaped {}", process);
        }
        self.enable();
    }

    /// Terminate the current process.
    pub fn exit(&self, code: i64) -> ! {
        let me = self.running();
        if me.stack.is_none() {
            panic!("{}: the boot context cannot exit (code {})", me, code);
        }
        if me.is_idle {
            panic!("idle process exited with {}", code);
        }
        me.in_signal.store(false, Ordering::Release);
        me.exit_code.store(code, Ordering::Release);
        let closed = me.release_resources(self.config.resource_table_capacity);
        self.run_exit_hooks(me, code, closed);

        me.done.signal(self, code);
        if let Some(parent) = me.parent() {
            self.signal(&parent, Signal::Chld);
        }

        self.disable();
        let this = self.current.lock().take();
        match this {
            Some(this) => {
                this.set_state(ProcessState::Terminated);
                self.queues.lock().reaper.push_back(this);
            }
            None => panic!("exit without a current process"),
        }
        self.reschedule(None);
        panic!("terminated process resumed");
    }

    fn run_exit_hooks(&self, me: &Process, code: i64, closed: usize) {
        self.disable();
        let cancelled = self.timers.lock().cancel_alarm(me.id);
        self.enable();
        log::info!(
            "{} exited with {} ({} resources closed{})",
            me,
            code,
            closed,
            if cancelled { ", alarm cancelled" } else { "" }
        );
    }

    /// Block until `process` exits and return its exit code.
    pub fn wait(&self, process: &Process) -> i64 {
        let done = process.completion();
        done.wait(self)
    }

    // ─── Diagnostics ────────────────────────────────────────────────

    pub fn stats(&self) -> KernelStats {
        KernelStats {
            context_switches: self.switches.load(Ordering::Relaxed),
            processes_created: self.created.load(Ordering::Relaxed),
            processes_reaped: self.reaped.load(Ordering::Relaxed),
            deferred_alarms: self.timers.lock().deferred(),
            jiffies: self.jiffies(),
            idle_jiffies: self.idle_jiffies.load(Ordering::Relaxed),
        }
    }

    pub fn lookup(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.directory.lock().get(&pid).and_then(Weak::upgrade)
    }

    /// Every process that has not been reaped, in creation order.
    pub fn live_processes(&self) -> Vec<Arc<Process>> {
        let mut live: Vec<Arc<Process>> = self.directory.lock().values().filter_map(Weak::upgrade).collect();
        live.sort_by_key(|p| p.id);
        live
    }

    /// Log a message tagged with the current process.
    pub fn trace(&self, args: fmt::Arguments<'_>) {
        let tag = match self.me() {
            Some(me) => alloc::format!("{}", me),
            None => String::from("kernel"),
        };
        log::info!("[{}] {}", tag, args);
    }
}

/// First Rust code run on a seeded kernel stack.
pub(crate) extern "C" fn process_entry(arg: usize) -> ! {
    // SAFETY: `arg` is the kernel pointer written by `new_process`; the
    // kernel outlives every process it dispatches.
    let kernel = unsafe { &*(arg as *const Kernel) };
    kernel.run_current()
}
