//! System Call Tests
//!
//! The register-level interface: console, files, semaphores, process
//! handles and program loading as seen from user code.

#[cfg(test)]
mod tests {
    use alloc::string::String;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::Mutex;

    use crate::config::USER_STACK_TOP;
    use crate::fs::RamFs;
    use crate::process::elf::ImageBuilder;
    use crate::process::Regs;
    use crate::scheduler::Kernel;
    use crate::syscall::SyscallNumber;
    use crate::tests::{boot, sys, CODE, DATA};

    fn run_user(h: &crate::tests::Harness, name: &str) -> i64 {
        let p = h.kernel.spawn_user(name, CODE, USER_STACK_TOP);
        h.kernel.start(p.clone());
        h.kernel.wait(&p)
    }

    // ========================================
    // Console
    // ========================================

    #[test]
    fn test_console_io() {
        let h = boot();
        h.machine.push_input(b"k");
        let m = h.machine.clone();
        h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
            sys(&m, k, regs, SyscallNumber::Putchar, [b'h' as u32, 0, 0]);
            sys(&m, k, regs, SyscallNumber::Putchar, [b'i' as u32, 0, 0]);
            let first = sys(&m, k, regs, SyscallNumber::Getchar, [0; 3]);
            let second = sys(&m, k, regs, SyscallNumber::Getchar, [0; 3]);
            if second != -1 {
                return -100;
            }
            first as i64
        });
        assert_eq!(run_user(&h, "console"), b'k' as i64);
        assert_eq!(h.machine.console_output(), "hi");
    }

    #[test]
    fn test_unknown_number() {
        let h = boot();
        let m = h.machine.clone();
        h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
            m.syscall(k, regs, 42, [0; 3]) as i64
        });
        assert_eq!(run_user(&h, "unknown"), -3);
    }

    // ========================================
    // Files
    // ========================================

    #[test]
    fn test_file_calls() {
        let h = boot();
        let fs = RamFs::new();
        fs.insert("/data.txt", b"kestrel kernel".to_vec());
        h.kernel.set_filesystem(Arc::new(fs));

        let results = Arc::new(Mutex::new(Vec::new()));
        let text = Arc::new(Mutex::new(String::new()));
        {
            let (m, results, text) = (h.machine.clone(), results.clone(), text.clone());
            h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
                let path = DATA;
                let missing = DATA + 0x40;
                let buf = DATA + 0x100;
                if m.store(k, regs, path, b"/data.txt\0").is_err()
                    || m.store(k, regs, missing, b"/nope\0").is_err()
                {
                    return -100;
                }
                let mut r = Vec::new();
                let fd = sys(&m, k, regs, SyscallNumber::Open, [path, 0, 0]);
                let fd = fd as u32;
                r.push(fd as i32);
                r.push(sys(&m, k, regs, SyscallNumber::GetLen, [fd, 0, 0]));
                r.push(sys(&m, k, regs, SyscallNumber::Read, [fd, buf, 7]));
                r.push(sys(&m, k, regs, SyscallNumber::Seek, [fd, 8, 0]));
                r.push(sys(&m, k, regs, SyscallNumber::Read, [fd, buf + 7, 100]));
                r.push(sys(&m, k, regs, SyscallNumber::Close, [fd, 0, 0]));
                r.push(sys(&m, k, regs, SyscallNumber::Close, [fd, 0, 0]));
                r.push(sys(&m, k, regs, SyscallNumber::Open, [missing, 0, 0]));
                r.push(sys(&m, k, regs, SyscallNumber::Read, [fd, buf, 1]));

                let mut bytes = [0u8; 13];
                if m.load(k, regs, buf, &mut bytes).is_ok() {
                    *text.lock() = String::from_utf8_lossy(&bytes).into_owned();
                }
                *results.lock() = r;
                0
            });
        }
        assert_eq!(run_user(&h, "reader"), 0);
        assert_eq!(*results.lock(), [0, 14, 7, 8, 6, 0, -1, -2, -1]);
        assert_eq!(*text.lock(), "kestrelkernel");
    }

    #[test]
    fn test_open_with_bad_pointer() {
        let h = boot();
        h.kernel.set_filesystem(Arc::new(RamFs::new()));
        let m = h.machine.clone();
        h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
            sys(&m, k, regs, SyscallNumber::Open, [0x10, 0, 0]) as i64
        });
        assert_eq!(run_user(&h, "wild"), -8);
    }

    #[test]
    fn test_read_into_bad_buffer_keeps_position() {
        let h = boot();
        let fs = RamFs::new();
        fs.insert("f", b"abc".to_vec());
        h.kernel.set_filesystem(Arc::new(fs));
        let results = Arc::new(Mutex::new(Vec::new()));
        {
            let (m, results) = (h.machine.clone(), results.clone());
            h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
                if m.store(k, regs, DATA, b"f\0").is_err() {
                    return -100;
                }
                let fd = sys(&m, k, regs, SyscallNumber::Open, [DATA, 0, 0]) as u32;
                let mut r = results.lock();
                r.push(sys(&m, k, regs, SyscallNumber::Read, [fd, 0x10, 3]));
                r.push(sys(&m, k, regs, SyscallNumber::Read, [fd, DATA + 0x100, 3]));
                0
            });
        }
        assert_eq!(run_user(&h, "careless"), 0);
        assert_eq!(*results.lock(), [-8, 3]);
    }

    // ========================================
    // Semaphores and process handles
    // ========================================

    #[test]
    fn test_semaphore_between_parent_and_child() {
        let h = boot();
        let m = h.machine.clone();
        // The child, resuming right after fork: eax = 0.
        h.machine.install(CODE + 4, move |k: &Kernel, regs: &mut Regs| {
            sys(&m, k, regs, SyscallNumber::Putchar, [b'c' as u32, 0, 0]);
            sys(&m, k, regs, SyscallNumber::Up, [0, 0, 0]);
            3
        });
        let m = h.machine.clone();
        h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
            let sem = sys(&m, k, regs, SyscallNumber::Semaphore, [0, 0, 0]);
            let child = sys(&m, k, regs, SyscallNumber::Fork, [0; 3]);
            sys(&m, k, regs, SyscallNumber::Down, [sem as u32, 0, 0]);
            sys(&m, k, regs, SyscallNumber::Putchar, [b'p' as u32, 0, 0]);
            let code = sys(&m, k, regs, SyscallNumber::Join, [child as u32, 0, 0]);
            if sem != 0 || child != 1 {
                return -100;
            }
            code as i64
        });
        assert_eq!(run_user(&h, "parent"), 3);
        assert_eq!(h.machine.console_output(), "cp");
    }

    #[test]
    fn test_down_on_a_file_handle_fails() {
        let h = boot();
        let fs = RamFs::new();
        fs.insert("f", b"x".to_vec());
        h.kernel.set_filesystem(Arc::new(fs));
        let m = h.machine.clone();
        h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
            if m.store(k, regs, DATA, b"f\0").is_err() {
                return -100;
            }
            let fd = sys(&m, k, regs, SyscallNumber::Open, [DATA, 0, 0]);
            sys(&m, k, regs, SyscallNumber::Down, [fd as u32, 0, 0]) as i64
        });
        assert_eq!(run_user(&h, "confused"), -1);
    }

    #[test]
    fn test_kill_child_through_handle() {
        let h = boot();
        let m = h.machine.clone();
        h.machine.install(CODE + 2, move |k: &Kernel, regs: &mut Regs| -> i64 {
            loop {
                m.tick(k, regs);
            }
        });
        let m = h.machine.clone();
        h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
            let child = sys(&m, k, regs, SyscallNumber::Fork, [0; 3]) as u32;
            if sys(&m, k, regs, SyscallNumber::Kill, [child, 99, 0]) != -5 {
                return -100;
            }
            sys(&m, k, regs, SyscallNumber::Kill, [child, 9, 0]);
            sys(&m, k, regs, SyscallNumber::Join, [child, 0, 0]) as i64
        });
        assert_eq!(run_user(&h, "parent"), 9);
    }

    // ========================================
    // Execv
    // ========================================

    #[test]
    fn test_execv_with_user_arguments() {
        const ENTRY: u32 = 0x8004_0000;
        let h = boot();
        let fs = RamFs::new();
        fs.insert("/bin/echo", ImageBuilder::new(ENTRY).segment(ENTRY, b"\x90", 0x10).build());
        h.kernel.set_filesystem(Arc::new(fs));

        let args = Arc::new(Mutex::new(Vec::new()));
        {
            let args = args.clone();
            h.machine.install(ENTRY, move |k: &Kernel, regs: &mut Regs| {
                let space = k.current_space();
                let argc = space.read_u32(regs.esp).unwrap_or(0);
                let argv = space.read_u32(regs.esp + 4).unwrap_or(0);
                let mut seen = args.lock();
                for i in 0..argc {
                    let ptr = space.read_u32(argv + 4 * i).unwrap_or(0);
                    seen.push(space.read_cstr(ptr, 32).unwrap_or_default());
                }
                argc as i64
            });
        }
        let m = h.machine.clone();
        h.machine.install(CODE, move |k: &Kernel, regs: &mut Regs| {
            let strings = DATA;
            let argv = DATA + 0x100;
            let ok = m.store(k, regs, strings, b"/bin/echo\0").is_ok()
                && m.store(k, regs, strings + 0x10, b"a\0").is_ok()
                && m.store(k, regs, strings + 0x20, b"bc\0").is_ok()
                && m.store_u32(k, regs, argv, strings).is_ok()
                && m.store_u32(k, regs, argv + 4, strings + 0x10).is_ok()
                && m.store_u32(k, regs, argv + 8, strings + 0x20).is_ok()
                && m.store_u32(k, regs, argv + 12, 0).is_ok();
            if !ok {
                return -100;
            }
            sys(&m, k, regs, SyscallNumber::Execv, [strings, argv, 0]) as i64
        });
        assert_eq!(run_user(&h, "shell"), 3);
        assert_eq!(*args.lock(), ["/bin/echo", "a", "bc"]);
    }
}
