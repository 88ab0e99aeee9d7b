//! User Memory Tests
//!
//! Page fault policy per region, explicit mappings and frame accounting.

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::Mutex;

    use crate::config::USER_STACK_TOP;
    use crate::process::Regs;
    use crate::scheduler::Kernel;
    use crate::syscall::SyscallNumber;
    use crate::tests::{boot, sys, CODE, DATA, HANDLER};

    const SIGSEGV: u32 = 11;

    /// An address in the mmap window nothing maps by itself.
    const WINDOW: u32 = 0x0050_0000;

    // ========================================
    // Fault regions
    // ========================================

    #[test]
    fn test_null_access_kills() {
        let h = boot();
        let m = h.machine.clone();
        h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
            let _ = m.store_u32(k, regs, 0x10, 1);
            0
        });
        let p = h.kernel.spawn_user("null", CODE, USER_STACK_TOP);
        h.kernel.start(p.clone());
        assert_eq!(h.kernel.wait(&p), -4);
    }

    #[test]
    fn test_image_region_grows_on_demand() {
        let h = boot();
        let m = h.machine.clone();
        h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
            let before = k.current_space().user_pages() as i64;
            if m.store_u32(k, regs, 0x9000_0000, 0xabcd).is_err() {
                return -100;
            }
            let value = m.load_u32(k, regs, 0x9000_0000).map_or(-1, i64::from);
            let after = k.current_space().user_pages() as i64;
            value * 10 + (after - before)
        });
        let p = h.kernel.spawn_user("grower", CODE, USER_STACK_TOP);
        h.kernel.start(p.clone());
        assert_eq!(h.kernel.wait(&p), 0xabcd * 10 + 1);
    }

    #[test]
    fn test_segv_handler_maps_and_retries() {
        let h = boot();
        let mapped = Arc::new(Mutex::new(Vec::new()));
        {
            let (m, mapped) = (h.machine.clone(), mapped.clone());
            h.machine.install(HANDLER, move |k: &Kernel, regs: &mut Regs| {
                let ctx = m.load_u32(k, regs, regs.esp + 4).unwrap_or(0);
                let cr2 = m.load_u32(k, regs, ctx).unwrap_or(0);
                let va = sys(&m, k, regs, SyscallNumber::Mmap, [cr2, 0, 0]);
                mapped.lock().extend([cr2, va as u32]);
                0
            });
        }
        let m = h.machine.clone();
        h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
            sys(&m, k, regs, SyscallNumber::Signal, [SIGSEGV, HANDLER, 0]);
            if m.store_u32(k, regs, WINDOW + 8, 77).is_ok() {
                return -100;
            }
            if m.service_signals(k, regs) != 1 {
                return -101;
            }
            if m.store_u32(k, regs, WINDOW + 8, 77).is_err() {
                return -102;
            }
            m.load_u32(k, regs, WINDOW + 8).map_or(-1, i64::from)
        });
        let p = h.kernel.spawn_user("mapper", CODE, USER_STACK_TOP);
        h.kernel.start(p.clone());
        assert_eq!(h.kernel.wait(&p), 77);
        assert_eq!(*mapped.lock(), [WINDOW + 8, WINDOW]);
    }

    #[test]
    fn test_unhandled_segv_exits_with_11() {
        let h = boot();
        let m = h.machine.clone();
        h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
            let _ = m.store_u32(k, regs, WINDOW, 1);
            0
        });
        let p = h.kernel.spawn_user("segv", CODE, USER_STACK_TOP);
        h.kernel.start(p.clone());
        assert_eq!(h.kernel.wait(&p), 11);
    }

    #[test]
    #[should_panic(expected = "in the kernel window")]
    fn test_kernel_window_fault_panics() {
        let h = boot();
        h.kernel.handle_page_fault(0x0010_0000);
    }

    #[test]
    fn test_mmap_outside_window_and_twice() {
        let h = boot();
        let results = Arc::new(Mutex::new(Vec::new()));
        {
            let (m, results) = (h.machine.clone(), results.clone());
            h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
                let mut r = results.lock();
                r.push(sys(&m, k, regs, SyscallNumber::Mmap, [WINDOW + 0x10, 0, 0]) as u32);
                r.push(sys(&m, k, regs, SyscallNumber::Mmap, [WINDOW, 0, 0]) as u32);
                r.push(sys(&m, k, regs, SyscallNumber::Mmap, [DATA, 0, 0]) as u32);
                r.push(sys(&m, k, regs, SyscallNumber::Mmap, [0x1000, 0, 0]) as u32);
                0
            });
        }
        let p = h.kernel.spawn_user("mmapper", CODE, USER_STACK_TOP);
        h.kernel.start(p.clone());
        assert_eq!(h.kernel.wait(&p), 0);
        assert_eq!(*results.lock(), [WINDOW, 0, -3i32 as u32, -3i32 as u32]);
    }

    // ========================================
    // Frame accounting
    // ========================================

    #[test]
    fn test_frames_return_after_exit() {
        let h = boot();
        let memory = h.kernel.memory().clone();
        let baseline = memory.frames_in_use();

        let m = h.machine.clone();
        h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
            for page in 0..4 {
                let _ = m.store_u32(k, regs, DATA + page * 0x1000, page);
            }
            let _ = m.store_u32(k, regs, 0xC000_0000, 1);
            sys(&m, k, regs, SyscallNumber::Mmap, [WINDOW, 0, 0]);
            k.current_space().user_pages() as i64
        });
        let p = h.kernel.spawn_user("hog", CODE, USER_STACK_TOP);
        h.kernel.start(p.clone());
        assert_eq!(h.kernel.wait(&p), 6);
        assert!(memory.frames_in_use() > baseline);

        drop(p);
        h.kernel.check_reaper();
        assert_eq!(memory.frames_in_use(), baseline);
    }
}
