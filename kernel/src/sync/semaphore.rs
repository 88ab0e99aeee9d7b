//! Counting semaphore.
//!
//! `up` hands its permit straight to the oldest live waiter when there
//! is one, so a woken process never has to re-check the count. Waiters
//! with a pending kill are readied without a permit and die at their
//! next kill check.

use spin::Mutex;

use crate::scheduler::Kernel;
use crate::sync::WaitQueue;

pub struct Semaphore {
    count: Mutex<u32>,
    waiters: WaitQueue,
}

impl Semaphore {
    pub const fn new(count: u32) -> Self {
        Semaphore {
            count: Mutex::new(count),
            waiters: WaitQueue::new(),
        }
    }

    pub fn count(&self) -> u32 {
        *self.count.lock()
    }

    pub fn waiters(&self) -> usize {
        self.waiters.len()
    }

    /// Take a permit, blocking until one is handed over.
    pub fn down(&self, kernel: &Kernel) {
        kernel.disable();
        let acquired = {
            let mut count = self.count.lock();
            if *count > 0 {
                *count -= 1;
                true
            } else {
                false
            }
        };
        if !acquired {
            kernel.block(&self.waiters);
        }
        kernel.enable();
    }

    /// Release a permit.
    pub fn up(&self, kernel: &Kernel) {
        kernel.disable();
        loop {
            match self.waiters.pop() {
                Some(next) if next.is_killed() => kernel.make_ready(next),
                Some(next) => {
                    kernel.make_ready(next);
                    break;
                }
                None => {
                    *self.count.lock() += 1;
                    break;
                }
            }
        }
        kernel.enable();
    }
}
