//! Kernel configuration constants.
//!
//! This module contains compile-time configuration for the kernel.
//! Values here affect memory layout, limits, and timer behaviour.
//! Per-instance knobs live in [`KernelConfig`].

use crate::error::{KernelError, KernelResult};

// ─── Memory layout ──────────────────────────────────────────────────

/// Physical frame / virtual page size (4 KB).
pub const FRAME_SIZE: u32 = 4096;

/// Entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Bytes covered by one page directory entry (4 MB).
pub const TABLE_SPAN: u32 = FRAME_SIZE * ENTRIES_PER_TABLE as u32;

/// End of the never-mapped null guard page.
pub const NULL_GUARD_END: u32 = 0x0000_1000;

/// End of the kernel identity window shared by every address space.
pub const KERNEL_WINDOW_END: u32 = 0x0040_0000;

/// Start of the window user code may populate with `mmap`.
pub const USER_MMAP_BASE: u32 = 0x0040_0000;

/// Start of the program image / stack region that grows on demand.
pub const USER_IMAGE_BASE: u32 = 0x8000_0000;

/// Initial user stack pointer for new program images.
pub const USER_STACK_TOP: u32 = 0xFFFF_FFF0;

// ─── Physical memory ────────────────────────────────────────────────

/// Default simulated physical memory size (4 MB, the whole kernel window).
pub const PHYS_MEM_SIZE: u32 = KERNEL_WINDOW_END;

/// Low physical memory reserved for the kernel image and devices.
pub const PHYS_RESERVED: u32 = 0x0010_0000;

// ─── Processes ──────────────────────────────────────────────────────

/// Stack size per kernel context (256 KB).
pub const KERNEL_STACK_SIZE: usize = 256 * 1024;

/// Smallest kernel stack a configuration may ask for.
pub const MIN_KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Bytes at the bottom of every kernel stack that must never be used.
pub const STACK_GUARD_SIZE: usize = 1024;

/// Slots in a fresh resource table.
pub const RESOURCE_TABLE_CAPACITY: usize = 100;

/// Longest string the kernel will copy in from user memory.
pub const MAX_USER_STRING: usize = 256;

/// Most arguments `execv` accepts.
pub const MAX_EXEC_ARGS: usize = 64;

// ─── Timer ──────────────────────────────────────────────────────────

/// Timer interrupt frequency in Hz.
pub const TIMER_HZ: u32 = 100;

// ─── Segment selectors ──────────────────────────────────────────────

pub const KERNEL_CODE_SELECTOR: u32 = 0x08;
pub const KERNEL_DATA_SELECTOR: u32 = 0x10;
pub const USER_CODE_SELECTOR: u32 = 0x1B;
pub const USER_DATA_SELECTOR: u32 = 0x23;

/// Interrupt-enable bit in EFLAGS.
pub const EFLAGS_IF: u32 = 1 << 9;

/// Reserved bit 1 of EFLAGS, always set.
pub const EFLAGS_RESERVED: u32 = 1 << 1;

/// Software interrupt vector used for system calls.
pub const SYSCALL_VECTOR: u8 = 0x64;

/// Per-instance kernel configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Bytes of physical memory handed to the frame allocator.
    pub phys_mem_size: u32,
    /// Bytes at the bottom of physical memory never handed out.
    pub phys_reserved: u32,
    /// Timer interrupts per second.
    pub timer_hz: u32,
    /// Kernel stack size for every created process.
    pub kernel_stack_size: usize,
    /// Slots in a fresh resource table.
    pub resource_table_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            phys_mem_size: PHYS_MEM_SIZE,
            phys_reserved: PHYS_RESERVED,
            timer_hz: TIMER_HZ,
            kernel_stack_size: KERNEL_STACK_SIZE,
            resource_table_capacity: RESOURCE_TABLE_CAPACITY,
        }
    }
}

impl KernelConfig {
    /// Check the configuration against the fixed memory layout.
    pub fn validate(&self) -> KernelResult<()> {
        if self.phys_mem_size % FRAME_SIZE != 0 || self.phys_reserved % FRAME_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        // Physical memory is reached through the kernel identity window.
        if self.phys_mem_size > KERNEL_WINDOW_END {
            return Err(KernelError::InvalidArgument);
        }
        if self.phys_reserved < NULL_GUARD_END || self.phys_reserved >= self.phys_mem_size {
            return Err(KernelError::InvalidArgument);
        }
        if self.timer_hz == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if self.kernel_stack_size < MIN_KERNEL_STACK_SIZE
            || self.kernel_stack_size <= STACK_GUARD_SIZE
            || self.kernel_stack_size % 16 != 0
        {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    /// Builder-style override of the timer frequency.
    pub fn with_timer_hz(mut self, hz: u32) -> Self {
        self.timer_hz = hz;
        self
    }

    /// Builder-style override of the physical memory size.
    pub fn with_phys_mem_size(mut self, bytes: u32) -> Self {
        self.phys_mem_size = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_memory_beyond_kernel_window() {
        let config = KernelConfig::default().with_phys_mem_size(KERNEL_WINDOW_END + FRAME_SIZE);
        assert_eq!(config.validate(), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_rejects_zero_hz() {
        let config = KernelConfig::default().with_timer_hz(0);
        assert_eq!(config.validate(), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_layout_windows_are_ordered() {
        assert!(NULL_GUARD_END < KERNEL_WINDOW_END);
        assert_eq!(KERNEL_WINDOW_END, USER_MMAP_BASE);
        assert!(USER_MMAP_BASE < USER_IMAGE_BASE);
        assert_eq!(USER_STACK_TOP % 16, 0);
    }
}
