//! Process control block.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use spin::Mutex;

use crate::memory::AddressSpace;
use crate::process::context::{Regs, UserContext};
use crate::process::resource::ResourceTable;
use crate::process::signal::SignalState;
use crate::scheduler::context::KernelStack;
use crate::scheduler::Kernel;
use crate::sync::Completion;

/// Process ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl ProcessId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created, never started
    Created,
    /// On the ready queue
    Ready,
    /// The current process
    Running,
    /// Parked on a wait queue
    Blocked,
    /// Exited, waiting for the reaper
    Terminated,
}

/// Kernel-mode body of a process.
pub type ProcessBody = Box<dyn FnOnce(&Kernel) -> i64>;

/// What a process does when first dispatched.
pub(crate) enum Entry {
    Kernel(ProcessBody),
    User(Regs),
}

/// Process Control Block
pub struct Process {
    pub(crate) id: ProcessId,
    pub(crate) name: Mutex<String>,
    pub(crate) state: Mutex<ProcessState>,
    /// Stack pointer of the suspended kernel context.
    pub(crate) saved_sp: AtomicUsize,
    /// `None` for the boot context, which runs on the stack it was born on.
    pub(crate) stack: Option<KernelStack>,
    pub(crate) address_space: AddressSpace,
    pub(crate) resources: Mutex<Arc<ResourceTable>>,
    pub(crate) exit_code: AtomicI64,
    pub(crate) kill_code: Mutex<Option<i64>>,
    pub(crate) disable_count: AtomicU32,
    pub(crate) irq_depth: AtomicU32,
    pub(crate) irq_count: AtomicU32,
    pub(crate) signals: Mutex<SignalState>,
    pub(crate) in_signal: AtomicBool,
    pub(crate) user: Mutex<UserContext>,
    pub(crate) done: Arc<Completion>,
    pub(crate) entry: Mutex<Option<Entry>>,
    pub(crate) parent: Option<Weak<Process>>,
    pub(crate) is_idle: bool,
}

impl Process {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ProcessId,
        name: &str,
        stack: Option<KernelStack>,
        saved_sp: usize,
        address_space: AddressSpace,
        resources: Arc<ResourceTable>,
        entry: Option<Entry>,
        parent: Option<Weak<Process>>,
        is_idle: bool,
    ) -> Self {
        Process {
            id,
            name: Mutex::new(String::from(name)),
            state: Mutex::new(ProcessState::Created),
            saved_sp: AtomicUsize::new(saved_sp),
            stack,
            address_space,
            resources: Mutex::new(resources),
            exit_code: AtomicI64::new(0),
            kill_code: Mutex::new(None),
            disable_count: AtomicU32::new(0),
            irq_depth: AtomicU32::new(0),
            irq_count: AtomicU32::new(0),
            signals: Mutex::new(SignalState::new()),
            in_signal: AtomicBool::new(false),
            user: Mutex::new(UserContext::new()),
            done: Arc::new(Completion::new()),
            entry: Mutex::new(entry),
            parent,
            is_idle,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.lock() = String::from(name);
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        *self.state.lock() = state;
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Record a kill request. The first request's code wins.
    pub(crate) fn request_kill(&self, code: i64) {
        let mut kill = self.kill_code.lock();
        if kill.is_none() {
            *kill = Some(code);
        }
    }

    pub fn kill_code(&self) -> Option<i64> {
        *self.kill_code.lock()
    }

    pub fn is_killed(&self) -> bool {
        self.kill_code().is_some()
    }

    pub fn disable_count(&self) -> u32 {
        self.disable_count.load(Ordering::Acquire)
    }

    pub fn irq_depth(&self) -> u32 {
        self.irq_depth.load(Ordering::Acquire)
    }

    pub fn irq_count(&self) -> u32 {
        self.irq_count.load(Ordering::Acquire)
    }

    pub fn in_signal(&self) -> bool {
        self.in_signal.load(Ordering::Acquire)
    }

    pub fn pending_signals(&self) -> usize {
        self.signals.lock().pending()
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.address_space
    }

    pub fn resources(&self) -> Arc<ResourceTable> {
        self.resources.lock().clone()
    }

    /// Give up this process's reference to its resource table, closing
    /// every resource if no other process shares it.
    pub(crate) fn release_resources(&self, replacement_capacity: usize) -> usize {
        let table = core::mem::replace(
            &mut *self.resources.lock(),
            Arc::new(ResourceTable::new(replacement_capacity)),
        );
        if Arc::strong_count(&table) == 1 {
            table.close_all()
        } else {
            0
        }
    }

    /// Completion signalled with the exit code.
    pub fn completion(&self) -> Arc<Completion> {
        self.done.clone()
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    /// Last trapped user registers.
    pub fn user_regs(&self) -> Regs {
        self.user.lock().regs
    }

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        self.entry.lock().take()
    }

    #[cfg(test)]
    pub(crate) fn corrupt_saved_sp(&self, sp: usize) {
        self.saved_sp.store(sp, Ordering::Release);
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name.lock(), self.id)
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &*self.name.lock())
            .field("state", &self.state())
            .field("disable_count", &self.disable_count())
            .field("in_signal", &self.in_signal())
            .finish()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        log::trace!("process {} destroyed", self.id);
    }
}
