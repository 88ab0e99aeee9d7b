//! Scheduler Scenario Tests
//!
//! Round-robin order, idle fallback, the disable discipline, kill and
//! reap accounting, and the stack guard.

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::Mutex;

    use crate::config::KernelConfig;
    use crate::hal::Machine;
    use crate::process::{ProcessState, Resource, ResourceTable, Signal};
    use crate::scheduler::Kernel;
    use crate::sync::{Semaphore, WaitQueue};
    use crate::tests::{boot, boot_with};

    // ========================================
    // Ordering
    // ========================================

    #[test]
    fn test_round_robin_order() {
        let h = boot();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut procs = Vec::new();
        for name in ["a", "b", "c"] {
            let log = log.clone();
            let p = h.kernel.create(name, None, move |k: &Kernel| {
                for i in 0..3 {
                    log.lock().push((name, i));
                    k.yield_now();
                }
                0
            });
            procs.push(p.clone());
            h.kernel.start(p);
        }
        for p in &procs {
            assert_eq!(h.kernel.wait(p), 0);
        }
        assert_eq!(
            *log.lock(),
            [
                ("a", 0),
                ("b", 0),
                ("c", 0),
                ("a", 1),
                ("b", 1),
                ("c", 1),
                ("a", 2),
                ("b", 2),
                ("c", 2),
            ]
        );
        assert_eq!(h.boot.disable_count(), 0);
        assert!(h.machine.interrupts_enabled());
    }

    #[test]
    fn test_yield_alone_returns() {
        let h = boot();
        let before = h.kernel.stats().context_switches;
        h.kernel.yield_now();
        assert_eq!(h.kernel.stats().context_switches, before);
        assert_eq!(h.boot.state(), ProcessState::Running);
    }

    #[test]
    fn test_idle_fallback_wakes_sleeper() {
        let h = boot_with(KernelConfig::default().with_timer_hz(10));
        let p = h.kernel.create("sleeper", None, |k: &Kernel| {
            k.sleep_for(2);
            k.seconds() as i64
        });
        h.kernel.start(p.clone());
        assert_eq!(h.kernel.wait(&p), 2);

        let stats = h.kernel.stats();
        assert!(stats.jiffies >= 20, "{:?}", stats);
        assert!(stats.idle_jiffies >= 19, "{:?}", stats);
        assert!(h.machine.halts() >= 20);
    }

    #[test]
    fn test_sleepers_for_same_second_share_a_node() {
        let h = boot_with(KernelConfig::default().with_timer_hz(10));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut procs = Vec::new();
        for (name, seconds) in [("late", 2u64), ("early", 1), ("early2", 1)] {
            let order = order.clone();
            let p = h.kernel.create(name, None, move |k: &Kernel| {
                k.sleep_until(seconds);
                order.lock().push(name);
                0
            });
            procs.push(p.clone());
            h.kernel.start(p);
        }
        h.kernel.yield_now();
        assert_eq!(h.kernel.timers.lock().sleeper_targets(), [10, 20]);
        for p in &procs {
            h.kernel.wait(p);
        }
        assert_eq!(*order.lock(), ["early", "early2", "late"]);
    }

    // ========================================
    // Disable discipline
    // ========================================

    #[test]
    fn test_nested_disable() {
        let h = boot();
        h.kernel.disable();
        h.kernel.disable();
        assert!(!h.machine.interrupts_enabled());
        h.kernel.enable();
        assert!(!h.machine.interrupts_enabled());
        assert_eq!(h.boot.disable_count(), 1);
        h.kernel.enable();
        assert!(h.machine.interrupts_enabled());
        assert_eq!(h.boot.disable_count(), 0);
    }

    #[test]
    #[should_panic(expected = "enable with disable count 0")]
    fn test_unbalanced_enable_panics() {
        let h = boot();
        h.kernel.enable();
    }

    #[test]
    #[should_panic(expected = "interrupt taken with disable count 1")]
    fn test_irq_while_disabled_panics() {
        let h = boot();
        h.kernel.disable();
        h.kernel.start_irq();
    }

    #[test]
    #[should_panic(expected = "interrupt return with disable count 2")]
    fn test_irq_return_mismatch_panics() {
        let h = boot();
        h.kernel.start_irq();
        h.kernel.disable();
        h.kernel.end_irq();
    }

    #[test]
    #[should_panic(expected = "blocked inside an interrupt handler")]
    fn test_block_in_irq_panics() {
        let h = boot();
        let queue = WaitQueue::new();
        h.kernel.start_irq();
        h.kernel.block(&queue);
    }

    #[test]
    fn test_irq_bracket_counts() {
        let h = boot();
        h.kernel.start_irq();
        assert_eq!(h.boot.irq_depth(), 1);
        assert_eq!(h.boot.disable_count(), 1);
        h.kernel.end_irq();
        assert_eq!(h.boot.irq_depth(), 0);
        assert_eq!(h.boot.irq_count(), 1);
        assert_eq!(h.boot.disable_count(), 0);
    }

    // ========================================
    // Lifecycle
    // ========================================

    #[test]
    fn test_kill_and_reap_accounting() {
        const N: usize = 8;
        let h = boot();
        let before = h.kernel.stats();
        let mut weak = Vec::new();
        let mut done = Vec::new();
        for _ in 0..N {
            let p = h.kernel.create("spinner", None, |k: &Kernel| -> i64 {
                loop {
                    k.yield_now();
                }
            });
            weak.push(Arc::downgrade(&p));
            done.push(p.completion());
            h.kernel.start(p);
        }
        h.kernel.yield_now();

        for (i, w) in weak.iter().enumerate() {
            let p = w.upgrade().expect("spinner alive");
            h.kernel.kill(&p, 100 + i as i64);
            h.kernel.kill(&p, -1);
        }
        for _ in 0..4 {
            if weak.iter().all(|w| w.upgrade().is_none()) {
                break;
            }
            h.kernel.yield_now();
        }

        assert!(weak.iter().all(|w| w.strong_count() == 0));
        for (i, d) in done.iter().enumerate() {
            assert_eq!(d.value(), Some(100 + i as i64));
        }
        let after = h.kernel.stats();
        assert_eq!(after.processes_reaped - before.processes_reaped, N as u64);
        assert_eq!(h.kernel.live_processes().len(), 1);
    }

    #[test]
    fn test_sigkill_terminates_kernel_process() {
        let h = boot();
        let p = h.kernel.create("victim", None, |k: &Kernel| -> i64 {
            loop {
                k.yield_now();
            }
        });
        h.kernel.start(p.clone());
        h.kernel.yield_now();
        h.kernel.signal(&p, Signal::Kill);
        assert_eq!(h.kernel.wait(&p), 9);
        assert_eq!(p.state(), ProcessState::Terminated);
    }

    #[test]
    fn test_kill_honored_by_yield_without_switch() {
        let h = boot();
        let p = h.kernel.create("lonely", None, |k: &Kernel| {
            k.signal(k.running(), Signal::Kill);
            k.yield_now();
            7
        });
        h.kernel.start(p.clone());
        assert_eq!(h.kernel.wait(&p), 9);
    }

    #[test]
    fn test_exit_posts_sigchld_to_parent() {
        let h = boot();
        let p = h.kernel.create("child", None, |_: &Kernel| 7);
        assert!(Arc::ptr_eq(&p.parent().expect("parent"), &h.boot));
        h.kernel.start(p.clone());
        assert_eq!(h.kernel.wait(&p), 7);
        assert_eq!(h.boot.pending_signals(), 1);
    }

    #[test]
    fn test_lookup_until_reaped() {
        let h = boot();
        let p = h.kernel.create("short", None, |_: &Kernel| 0);
        let pid = p.id();
        assert!(h.kernel.lookup(pid).is_some());
        let ids: Vec<_> = h.kernel.live_processes().iter().map(|p| p.id()).collect();
        assert_eq!(ids, [h.boot.id(), pid]);

        h.kernel.start(p.clone());
        h.kernel.wait(&p);
        drop(p);
        h.kernel.check_reaper();
        assert!(h.kernel.lookup(pid).is_none());
    }

    #[test]
    fn test_shared_table_closed_by_last_holder() {
        let h = boot();
        let sem = Arc::new(Semaphore::new(1));
        let table = Arc::new(ResourceTable::new(8));
        table.open(Resource::Semaphore(sem.clone())).unwrap();

        let first = h.kernel.create("first", Some(table.clone()), |_: &Kernel| 0);
        let second = h.kernel.create("second", Some(table), |_: &Kernel| 0);

        h.kernel.start(first.clone());
        h.kernel.wait(&first);
        assert_eq!(Arc::strong_count(&sem), 2);
        assert!(first.resources().is_empty());

        h.kernel.start(second.clone());
        h.kernel.wait(&second);
        assert_eq!(Arc::strong_count(&sem), 1);
    }

    // ========================================
    // Synchronization
    // ========================================

    #[test]
    fn test_semaphore_hands_off_permits() {
        let h = boot();
        let sem = Arc::new(Semaphore::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        let consumer = {
            let (sem, log) = (sem.clone(), log.clone());
            h.kernel.create("consumer", None, move |k: &Kernel| {
                for _ in 0..3 {
                    sem.down(k);
                    log.lock().push("take");
                }
                0
            })
        };
        let producer = {
            let (sem, log) = (sem.clone(), log.clone());
            h.kernel.create("producer", None, move |k: &Kernel| {
                for _ in 0..3 {
                    log.lock().push("give");
                    sem.up(k);
                    k.yield_now();
                }
                0
            })
        };
        h.kernel.start(consumer.clone());
        h.kernel.start(producer.clone());
        h.kernel.wait(&consumer);
        h.kernel.wait(&producer);

        assert_eq!(*log.lock(), ["give", "take", "give", "take", "give", "take"]);
        assert_eq!(sem.count(), 0);
        assert_eq!(sem.waiters(), 0);
    }

    #[test]
    fn test_up_skips_killed_waiter() {
        let h = boot();
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            h.kernel.create("waiter", None, move |k: &Kernel| {
                sem.down(k);
                0
            })
        };
        h.kernel.start(waiter.clone());
        h.kernel.yield_now();
        assert_eq!(sem.waiters(), 1);

        h.kernel.kill(&waiter, 5);
        sem.up(&h.kernel);
        assert_eq!(h.kernel.wait(&waiter), 5);
        assert_eq!(sem.count(), 1);
        assert_eq!(sem.waiters(), 0);
    }

    // ========================================
    // Stack guard
    // ========================================

    #[test]
    #[should_panic(expected = "kernel stack overflow switching from boot#1 to victim#2")]
    fn test_stack_guard_violation_panics() {
        let h = boot();
        let p = h.kernel.create("victim", None, |_: &Kernel| 0);
        p.corrupt_saved_sp(64);
        h.kernel.start(p);
        h.kernel.yield_now();
    }
}
