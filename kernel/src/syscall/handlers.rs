//! System call handlers.
//!
//! Thin glue between the register interface and the kernel: decode the
//! arguments, validate user pointers, call into the kernel.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::{SyscallArgs, SyscallNumber, SyscallReturn};
use crate::config::{MAX_EXEC_ARGS, MAX_USER_STRING};
use crate::error::{KernelError, KernelResult};
use crate::fs::OpenFile;
use crate::memory::MapOutcome;
use crate::process::{Disposition, Resource, Signal};
use crate::scheduler::Kernel;
use crate::sync::Semaphore;

type SyscallResult = KernelResult<i64>;

/// Handle a system call.
pub fn handle(kernel: &Kernel, syscall: SyscallNumber, args: &SyscallArgs) -> SyscallReturn {
    let result = match syscall {
        SyscallNumber::Exit => handle_exit(kernel, args),
        SyscallNumber::Putchar => handle_putchar(kernel, args),
        SyscallNumber::Fork => handle_fork(kernel),
        SyscallNumber::Semaphore => handle_semaphore(kernel, args),
        SyscallNumber::Down => handle_down(kernel, args),
        SyscallNumber::Up => handle_up(kernel, args),
        SyscallNumber::Join => handle_join(kernel, args),
        SyscallNumber::Shutdown => handle_shutdown(kernel),
        SyscallNumber::Open => handle_open(kernel, args),
        SyscallNumber::GetLen => handle_getlen(kernel, args),
        SyscallNumber::Read => handle_read(kernel, args),
        SyscallNumber::Seek => handle_seek(kernel, args),
        SyscallNumber::Close => handle_close(kernel, args),
        SyscallNumber::Execv => handle_execv(kernel, args),
        SyscallNumber::Getchar => handle_getchar(kernel),
        SyscallNumber::Kill => handle_kill(kernel, args),
        SyscallNumber::Signal => handle_signal(kernel, args),
        SyscallNumber::Alarm => handle_alarm(kernel, args),
        SyscallNumber::Mmap => handle_mmap(kernel, args),
        SyscallNumber::SigReturn => return handle_sigreturn(kernel),
    };
    match result {
        Ok(value) => SyscallReturn::Value(value),
        Err(err) => err.into(),
    }
}

fn handle_exit(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    kernel.exit(args.arg1 as i32 as i64)
}

fn handle_putchar(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    kernel.machine().console_write(args.arg1 as u8);
    Ok(0)
}

fn handle_fork(kernel: &Kernel) -> SyscallResult {
    let regs = kernel.running().user_regs();
    kernel.fork(&regs).map(i64::from)
}

fn handle_semaphore(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    let semaphore = Arc::new(Semaphore::new(args.arg1));
    let handle = kernel.running().resources().open(Resource::Semaphore(semaphore))?;
    Ok(handle.into())
}

fn handle_down(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    let semaphore = kernel.running().resources().get_semaphore(args.arg1)?;
    semaphore.down(kernel);
    Ok(0)
}

fn handle_up(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    let semaphore = kernel.running().resources().get_semaphore(args.arg1)?;
    semaphore.up(kernel);
    Ok(0)
}

fn handle_join(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    let done = kernel.running().resources().get_process(args.arg1)?.completion();
    let code = done.wait(kernel);
    kernel.running().resources().close(args.arg1)?;
    Ok(code)
}

fn handle_shutdown(kernel: &Kernel) -> SyscallResult {
    log::info!("shutdown requested by {}", kernel.running());
    kernel.machine().shutdown()
}

fn handle_open(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    let path = kernel.current_space().read_cstr(args.arg1, MAX_USER_STRING)?;
    let fs = kernel.filesystem().ok_or(KernelError::NotFound)?;
    let file = fs.lookup_file(&path).ok_or(KernelError::NotFound)?;
    let handle = kernel
        .running()
        .resources()
        .open(Resource::File(Arc::new(OpenFile::new(file))))?;
    Ok(handle.into())
}

fn handle_getlen(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    let file = kernel.running().resources().get_file(args.arg1)?;
    Ok(file.len().into())
}

fn handle_read(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    let file = kernel.running().resources().get_file(args.arg1)?;
    let start = file.position();
    let remaining = file.len().saturating_sub(start);
    let mut buf = vec![0u8; args.arg3.min(remaining) as usize];
    let n = file.read(&mut buf);
    if let Err(err) = kernel.current_space().copy_out(args.arg2, &buf[..n]) {
        // A failed copy consumes nothing.
        file.seek(start);
        return Err(err);
    }
    Ok(n as i64)
}

fn handle_seek(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    let file = kernel.running().resources().get_file(args.arg1)?;
    Ok(file.seek(args.arg2).into())
}

fn handle_close(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    kernel.running().resources().close(args.arg1)?;
    Ok(0)
}

fn handle_execv(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    let space = kernel.current_space();
    let path = space.read_cstr(args.arg1, MAX_USER_STRING)?;
    let mut argv: Vec<String> = Vec::new();
    let mut cursor = args.arg2;
    loop {
        let ptr = space.read_u32(cursor)?;
        if ptr == 0 {
            break;
        }
        if argv.len() == MAX_EXEC_ARGS {
            return Err(KernelError::InvalidArgument);
        }
        argv.push(space.read_cstr(ptr, MAX_USER_STRING)?);
        cursor = cursor.checked_add(4).ok_or(KernelError::BadAddress)?;
    }
    match kernel.execv(&path, &argv)? {}
}

fn handle_getchar(kernel: &Kernel) -> SyscallResult {
    Ok(kernel.machine().console_read().map_or(-1, i64::from))
}

fn handle_kill(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    let signal = Signal::from_number(args.arg2).ok_or(KernelError::InvalidArgument)?;
    let target = kernel.running().resources().get_process(args.arg1)?;
    kernel.signal(&target, signal);
    Ok(0)
}

fn handle_signal(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    let signal = Signal::from_number(args.arg1).ok_or(KernelError::NotPossible)?;
    let action = Disposition::decode(signal, args.arg2)?;
    kernel.set_signal_action(signal, action)?;
    Ok(0)
}

fn handle_alarm(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    kernel.alarm(args.arg1);
    Ok(0)
}

fn handle_mmap(kernel: &Kernel, args: &SyscallArgs) -> SyscallResult {
    match kernel.current_space().mmap(args.arg1)? {
        MapOutcome::Mapped(va) => Ok(va.into()),
        MapOutcome::AlreadyMapped => Ok(0),
    }
}

fn handle_sigreturn(kernel: &Kernel) -> SyscallReturn {
    match kernel.sigreturn() {
        Ok(()) => SyscallReturn::Resume,
        Err(err) => err.into(),
    }
}
