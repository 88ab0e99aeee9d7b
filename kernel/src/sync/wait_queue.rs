//! Wait Queue
//!
//! FIFO of processes parked by [`Kernel::block`](crate::scheduler::Kernel::block).
//! The queue holds the scheduler's reference while a process sleeps.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use spin::Mutex;

use crate::process::Process;

pub struct WaitQueue {
    waiters: Mutex<VecDeque<Arc<Process>>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        WaitQueue {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, process: Arc<Process>) {
        self.waiters.lock().push_back(process);
    }

    /// Oldest waiter.
    pub fn pop(&self) -> Option<Arc<Process>> {
        self.waiters.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
