//! Interrupt-disable discipline.
//!
//! Each process carries a nesting counter over the CPU interrupt flag.
//! `disable` always masks; only the `enable` that brings the counter
//! back to zero unmasks. Interrupt handlers are bracketed by
//! [`Kernel::start_irq`] / [`Kernel::end_irq`], which require the
//! interrupted process to have been fully enabled.

use core::sync::atomic::Ordering;

use crate::scheduler::Kernel;

impl Kernel {
    /// Mask interrupts and bump the current process's disable count.
    pub fn disable(&self) {
        self.machine().set_interrupts(false);
        if let Some(me) = self.me() {
            me.disable_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Undo one [`Kernel::disable`].
    pub fn enable(&self) {
        let Some(me) = self.me() else {
            self.machine().set_interrupts(true);
            return;
        };
        let count = me.disable_count();
        if count == 0 {
            panic!(
                "{}: enable with disable count 0 (irq depth {}, {} interrupts)",
                me,
                me.irq_depth(),
                me.irq_count()
            );
        }
        me.disable_count.store(count - 1, Ordering::Release);
        if count == 1 {
            self.machine().set_interrupts(true);
        }
    }

    /// Enter an interrupt handler on the current process's stack.
    pub fn start_irq(&self) {
        let me = self.running();
        let count = me.disable_count();
        if count != 0 {
            panic!(
                "{}: interrupt taken with disable count {} (irq depth {}, {} interrupts)",
                me,
                count,
                me.irq_depth(),
                me.irq_count()
            );
        }
        self.machine().set_interrupts(false);
        me.disable_count.store(1, Ordering::Release);
        me.irq_depth.fetch_add(1, Ordering::AcqRel);
        me.irq_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Leave an interrupt handler.
    pub fn end_irq(&self) {
        let me = self.running();
        let count = me.disable_count();
        let depth = me.irq_depth();
        if count != 1 || depth == 0 {
            panic!(
                "{}: interrupt return with disable count {} (irq depth {}, {} interrupts)",
                me,
                count,
                depth,
                me.irq_count()
            );
        }
        me.disable_count.store(0, Ordering::Release);
        me.irq_depth.fetch_sub(1, Ordering::AcqRel);
    }
}
