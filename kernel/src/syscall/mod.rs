//! System call handling module.
//!
//! User code enters with `int 0x64`: the number in `eax`, up to three
//! arguments in `ebx`, `ecx` and `edx`. Results and negative
//! [`KernelError`](crate::error::KernelError) codes come back in `eax`.

pub mod handlers;

use crate::error::KernelError;
use crate::scheduler::Kernel;

/// System call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyscallNumber {
    // ==========================================
    // Processes (0-7)
    // ==========================================
    /// Terminate the calling process.
    Exit = 0,
    /// Write one byte to the console.
    Putchar = 1,
    /// Duplicate the calling process.
    Fork = 2,
    /// Create a semaphore.
    Semaphore = 3,
    /// Take a semaphore permit.
    Down = 4,
    /// Release a semaphore permit.
    Up = 5,
    /// Wait for a child and close its handle.
    Join = 6,
    /// Power off.
    Shutdown = 7,

    // ==========================================
    // Files (8-14)
    // ==========================================
    Open = 8,
    GetLen = 9,
    Read = 10,
    Seek = 11,
    Close = 12,
    /// Replace the program image.
    Execv = 13,
    /// Read one console byte, -1 if none is buffered.
    Getchar = 14,

    // ==========================================
    // Signals and memory (15-18)
    // ==========================================
    Kill = 15,
    Signal = 16,
    Alarm = 17,
    Mmap = 18,

    /// Return from a signal handler. Issued by the handler jumper.
    SigReturn = 0xff,
}

/// `eax` value of the sigreturn call made by the handler jumper.
pub const SYS_SIGRETURN: u32 = SyscallNumber::SigReturn as u32;

impl TryFrom<u32> for SyscallNumber {
    type Error = KernelError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SyscallNumber::Exit),
            1 => Ok(SyscallNumber::Putchar),
            2 => Ok(SyscallNumber::Fork),
            3 => Ok(SyscallNumber::Semaphore),
            4 => Ok(SyscallNumber::Down),
            5 => Ok(SyscallNumber::Up),
            6 => Ok(SyscallNumber::Join),
            7 => Ok(SyscallNumber::Shutdown),
            8 => Ok(SyscallNumber::Open),
            9 => Ok(SyscallNumber::GetLen),
            10 => Ok(SyscallNumber::Read),
            11 => Ok(SyscallNumber::Seek),
            12 => Ok(SyscallNumber::Close),
            13 => Ok(SyscallNumber::Execv),
            14 => Ok(SyscallNumber::Getchar),
            15 => Ok(SyscallNumber::Kill),
            16 => Ok(SyscallNumber::Signal),
            17 => Ok(SyscallNumber::Alarm),
            18 => Ok(SyscallNumber::Mmap),
            0xff => Ok(SyscallNumber::SigReturn),
            _ => Err(KernelError::NotPossible),
        }
    }
}

/// Raw argument registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallArgs {
    pub arg1: u32,
    pub arg2: u32,
    pub arg3: u32,
}

/// What to put back in the trapped context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallReturn {
    /// Store in `eax`.
    Value(i64),
    /// The handler rewrote the whole context; leave it alone.
    Resume,
}

impl From<KernelError> for SyscallReturn {
    fn from(err: KernelError) -> Self {
        SyscallReturn::Value(err.code())
    }
}

/// Decode and run one system call.
pub fn dispatch(kernel: &Kernel, number: u32, args: [u32; 3]) -> SyscallReturn {
    let args = SyscallArgs {
        arg1: args[0],
        arg2: args[1],
        arg3: args[2],
    };
    let syscall = match SyscallNumber::try_from(number) {
        Ok(syscall) => syscall,
        Err(err) => {
            log::debug!("unknown system call {}", number);
            return err.into();
        }
    };

    #[cfg(feature = "trace-syscalls")]
    kernel.trace(format_args!("{:?}({:#x}, {:#x}, {:#x})", syscall, args.arg1, args.arg2, args.arg3));

    let result = handlers::handle(kernel, syscall, &args);

    #[cfg(feature = "trace-syscalls")]
    kernel.trace(format_args!("{:?} → {:?}", syscall, result));

    result
}
