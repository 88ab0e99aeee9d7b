//! Completion event.
//!
//! Set once with a value; every current and future waiter observes it.
//! Processes join on each other through the completion they own.

use spin::Mutex;

use crate::scheduler::Kernel;
use crate::sync::WaitQueue;

pub struct Completion {
    value: Mutex<Option<i64>>,
    waiters: WaitQueue,
}

impl Completion {
    pub const fn new() -> Self {
        Completion {
            value: Mutex::new(None),
            waiters: WaitQueue::new(),
        }
    }

    pub fn value(&self) -> Option<i64> {
        *self.value.lock()
    }

    /// Record `value` and wake every waiter. Later signals are ignored.
    pub fn signal(&self, kernel: &Kernel, value: i64) {
        kernel.disable();
        {
            let mut slot = self.value.lock();
            if slot.is_none() {
                *slot = Some(value);
            }
        }
        while let Some(waiter) = self.waiters.pop() {
            kernel.make_ready(waiter);
        }
        kernel.enable();
    }

    /// Block until the event is signalled and return its value.
    pub fn wait(&self, kernel: &Kernel) -> i64 {
        kernel.disable();
        loop {
            let value = self.value();
            if let Some(value) = value {
                kernel.enable();
                return value;
            }
            kernel.block(&self.waiters);
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
