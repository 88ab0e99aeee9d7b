//! Two-level 32-bit page table entries.
//!
//! A virtual address splits into a 10-bit directory index, a 10-bit
//! table index and a 12-bit offset.

use bitflags::bitflags;

use crate::config::{ENTRIES_PER_TABLE, FRAME_SIZE};
use crate::memory::{PhysAddr, VirtAddr};

bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u32 {
        /// Page is present in memory.
        const PRESENT = 1 << 0;
        /// Page is writable.
        const WRITABLE = 1 << 1;
        /// Page is accessible from user mode.
        const USER_ACCESSIBLE = 1 << 2;
        /// Page has been accessed.
        const ACCESSED = 1 << 5;
        /// Page has been written to.
        const DIRTY = 1 << 6;
    }
}

/// Flags of an ordinary user data page.
pub const USER_PAGE: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

/// Flags of a kernel-only identity page.
pub const KERNEL_PAGE: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

/// A single page directory or page table entry.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        PageTableEntry(0)
    }

    pub fn new(frame: PhysAddr, flags: PageTableFlags) -> Self {
        PageTableEntry((frame & !(FRAME_SIZE - 1)) | flags.bits())
    }

    pub const fn from_raw(raw: u32) -> Self {
        PageTableEntry(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    pub fn frame(self) -> PhysAddr {
        self.0 & !(FRAME_SIZE - 1)
    }

    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }
}

/// Page directory index of `va`.
pub const fn pd_index(va: VirtAddr) -> usize {
    (va >> 22) as usize
}

/// Page table index of `va`.
pub const fn pt_index(va: VirtAddr) -> usize {
    ((va >> 12) as usize) & (ENTRIES_PER_TABLE - 1)
}

/// Virtual address formed from directory and table indices.
pub const fn va_of(pd: usize, pt: usize) -> VirtAddr {
    ((pd << 22) | (pt << 12)) as VirtAddr
}

/// Round `va` down to its page.
pub const fn page_base(va: VirtAddr) -> VirtAddr {
    va & !(FRAME_SIZE - 1)
}

/// Physical address of entry `index` of the table at `table`.
pub const fn entry_addr(table: PhysAddr, index: usize) -> PhysAddr {
    table + (index * 4) as PhysAddr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_split() {
        let va = 0x8040_3123;
        assert_eq!(pd_index(va), 0x201);
        assert_eq!(pt_index(va), 0x003);
        assert_eq!(va_of(0x201, 0x003), page_base(va));
    }

    #[test]
    fn test_entry_round_trip() {
        let pte = PageTableEntry::new(0x0012_3000, USER_PAGE);
        assert!(pte.is_present());
        assert_eq!(pte.frame(), 0x0012_3000);
        assert!(pte.flags().contains(PageTableFlags::USER_ACCESSIBLE));
        assert_eq!(pte.raw(), 0x0012_3007);
        assert!(!PageTableEntry::empty().is_present());
    }
}
