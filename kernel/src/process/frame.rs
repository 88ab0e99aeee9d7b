//! User stack frame builder.
//!
//! Builds byte images of data pushed onto a downward-growing user stack:
//! the `execv` argument block and the signal handler frame with its
//! sigreturn jumper. Every write is bounds checked against the region
//! built so far; the finished image is copied to user memory in one go.

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::SYSCALL_VECTOR;
use crate::error::{KernelError, KernelResult};
use crate::memory::VirtAddr;
use crate::process::context::Regs;
use crate::process::signal::Signal;

/// Largest image a builder will produce.
const MAX_IMAGE: u32 = 64 * 1024;

/// Downward-growing stack image anchored at `top`.
pub struct StackBuilder {
    top: VirtAddr,
    sp: VirtAddr,
    /// `image[i]` is the byte at `sp + i`.
    image: Vec<u8>,
}

impl StackBuilder {
    pub fn new(top: VirtAddr) -> Self {
        StackBuilder {
            top,
            sp: top,
            image: Vec::new(),
        }
    }

    pub fn sp(&self) -> VirtAddr {
        self.sp
    }

    /// Move the stack pointer down to `new_sp`, zero-filling the gap.
    fn extend_to(&mut self, new_sp: VirtAddr) -> KernelResult<()> {
        if new_sp > self.sp {
            return Ok(());
        }
        if self.top - new_sp > MAX_IMAGE {
            return Err(KernelError::InvalidArgument);
        }
        let extra = (self.sp - new_sp) as usize;
        self.image.splice(0..0, core::iter::repeat(0u8).take(extra));
        self.sp = new_sp;
        Ok(())
    }

    /// Reserve `len` bytes and return their address.
    pub fn reserve(&mut self, len: u32) -> KernelResult<VirtAddr> {
        let new_sp = self.sp.checked_sub(len).ok_or(KernelError::BadAddress)?;
        self.extend_to(new_sp)?;
        Ok(self.sp)
    }

    /// Push raw bytes and return their address.
    pub fn push_bytes(&mut self, data: &[u8]) -> KernelResult<VirtAddr> {
        let at = self.reserve(data.len() as u32)?;
        self.write_at(at, data)?;
        Ok(at)
    }

    pub fn push_u32(&mut self, value: u32) -> KernelResult<VirtAddr> {
        self.push_bytes(&value.to_le_bytes())
    }

    /// Align the stack pointer down to `align` (a power of two).
    pub fn align_down(&mut self, align: u32) -> KernelResult<()> {
        debug_assert!(align.is_power_of_two());
        self.extend_to(self.sp & !(align - 1))
    }

    /// Overwrite already-reserved bytes at `va`.
    pub fn write_at(&mut self, va: VirtAddr, data: &[u8]) -> KernelResult<()> {
        if va < self.sp || va as u64 + data.len() as u64 > self.top as u64 {
            return Err(KernelError::BadAddress);
        }
        let off = (va - self.sp) as usize;
        self.image[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn write_u32_at(&mut self, va: VirtAddr, value: u32) -> KernelResult<()> {
        self.write_at(va, &value.to_le_bytes())
    }

    /// Final stack pointer and the bytes in `[sp, top)`.
    pub fn finish(self) -> (VirtAddr, Vec<u8>) {
        (self.sp, self.image)
    }
}

/// Argument block for a new program image.
///
/// ```text
/// top  → argument strings, argv[0] highest
///        NULL-terminated argv pointer array
/// sp   → argc, argv, 8 bytes padding   (sp = (array & !7) - 16)
/// ```
pub fn build_argv_stack(top: VirtAddr, args: &[String]) -> KernelResult<(VirtAddr, Vec<u8>)> {
    let mut builder = StackBuilder::new(top);
    let mut pointers = Vec::with_capacity(args.len());
    for arg in args {
        builder.reserve(1)?;
        let nul = builder.sp();
        builder.write_at(nul, &[0])?;
        pointers.push(builder.push_bytes(arg.as_bytes())?);
    }
    builder.align_down(4)?;
    builder.push_u32(0)?;
    for ptr in pointers.iter().rev() {
        builder.push_u32(*ptr)?;
    }
    let argv = builder.sp();
    builder.align_down(8)?;
    let base = builder.reserve(16)?;
    builder.write_u32_at(base, args.len() as u32)?;
    builder.write_u32_at(base + 4, argv)?;
    Ok(builder.finish())
}

/// Machine code placed on the user stack to return from a handler:
/// `mov eax, 0xff; int 0x64; hlt`.
pub const SIGRETURN_JUMPER: [u8; 8] = [0xB8, 0xFF, 0x00, 0x00, 0x00, 0xCD, SYSCALL_VECTOR, 0xF4];

/// Signal handler frame as seen by the handler at `esp`.
///
/// ```text
/// esp + 0   return address (the jumper)
/// esp + 4   pointer to the saved registers
/// esp + 8   signal number
/// esp + 12  saved Regs
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFrame {
    pub return_address: VirtAddr,
    pub context: VirtAddr,
    pub signo: u32,
    pub regs: Regs,
}

impl SignalFrame {
    pub const SIZE: usize = 12 + Regs::SIZE;

    /// Offset of the saved registers inside the frame.
    pub const REGS_OFFSET: u32 = 12;

    /// Build the jumper and frame below the interrupted stack pointer.
    ///
    /// The frame is placed so that `esp + 4` is 16-byte aligned, as it
    /// would be right after a call. Returns the frame address and the
    /// image to copy out.
    pub fn build(interrupted: &Regs, signal: Signal) -> KernelResult<(VirtAddr, VirtAddr, Vec<u8>)> {
        let mut builder = StackBuilder::new(interrupted.esp);
        builder.align_down(4)?;
        let jumper = builder.push_bytes(&SIGRETURN_JUMPER)?;
        builder.reserve(Self::SIZE as u32)?;
        builder.align_down(16)?;
        let frame_at = builder.reserve(4)?;
        let frame = SignalFrame {
            return_address: jumper,
            context: frame_at + Self::REGS_OFFSET,
            signo: signal.number(),
            regs: *interrupted,
        };
        builder.write_at(frame_at, &frame.encode())?;
        let (sp, image) = builder.finish();
        Ok((frame_at, sp, image))
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let head = [self.return_address, self.context, self.signo];
        for (i, w) in head.iter().chain(self.regs.to_words().iter()).enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]]);
        let mut regs = [0u32; Regs::WORDS];
        for (i, r) in regs.iter_mut().enumerate() {
            *r = word(3 + i);
        }
        SignalFrame {
            return_address: word(0),
            context: word(1),
            signo: word(2),
            regs: Regs::from_words(&regs),
        }
    }
}
