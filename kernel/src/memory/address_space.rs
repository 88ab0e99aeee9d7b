//! Per-Process Address Space
//!
//! Every process owns a page directory. Directory entry 0 points at the
//! single shared kernel page table, entries 1-1023 point at private user
//! tables allocated on demand.
//!
//! # Address Space Layout
//!
//! ```text
//! 0x0000_0000 - 0x0000_0FFF  Null guard (never mapped)
//! 0x0000_1000 - 0x003F_FFFF  Kernel identity window (shared, supervisor)
//! 0x0040_0000 - 0x7FFF_FFFF  mmap window (SIGSEGV on fault)
//! 0x8000_0000 - 0xFFFF_FFFF  Program image and stack (grows on fault)
//! ```

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::{
    ENTRIES_PER_TABLE, FRAME_SIZE, KERNEL_WINDOW_END, NULL_GUARD_END, USER_IMAGE_BASE,
    USER_MMAP_BASE,
};
use crate::error::{KernelError, KernelResult};
use crate::hal::Machine;
use crate::memory::frame::PhysMem;
use crate::memory::paging::{
    entry_addr, page_base, pd_index, pt_index, va_of, PageTableEntry, PageTableFlags,
    KERNEL_PAGE, USER_PAGE,
};
use crate::memory::{PhysAddr, VirtAddr};

/// Result of a successful [`AddressSpace::mmap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    /// A fresh frame now backs the page at this address.
    Mapped(VirtAddr),
    /// The page was already present; nothing changed.
    AlreadyMapped,
}

/// Kind of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// A translation failure, reported with the faulting address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub va: VirtAddr,
    pub access: Access,
}

/// Region a faulting address falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultRegion {
    /// Below the first valid page. The process is killed.
    NullGuard,
    /// Kernel window. A fault here is a kernel bug.
    KernelWindow,
    /// General user region. User code gets SIGSEGV.
    MmapWindow,
    /// Image and stack region. Grows silently.
    Growable,
}

/// Classify a faulting virtual address.
pub fn classify_fault(va: VirtAddr) -> FaultRegion {
    if va < NULL_GUARD_END {
        FaultRegion::NullGuard
    } else if va < KERNEL_WINDOW_END {
        FaultRegion::KernelWindow
    } else if va < USER_IMAGE_BASE {
        FaultRegion::MmapWindow
    } else {
        FaultRegion::Growable
    }
}

/// A two-level page table plus the physical memory it lives in.
pub struct AddressSpace {
    memory: Arc<PhysMem>,
    directory: PhysAddr,
}

impl AddressSpace {
    /// Build the kernel page table identity-mapping the kernel window.
    ///
    /// The table is shared by every address space and never freed.
    pub fn build_kernel_table(memory: &PhysMem) -> PhysAddr {
        let table = memory.alloc();
        let limit = memory.size().min(KERNEL_WINDOW_END);
        let mut va = NULL_GUARD_END;
        while va < limit {
            let pte = PageTableEntry::new(va, KERNEL_PAGE);
            memory.write_u32(entry_addr(table, pt_index(va)), pte.raw());
            va += FRAME_SIZE;
        }
        table
    }

    /// Create an address space with only the kernel window mapped.
    pub fn new(memory: Arc<PhysMem>, kernel_table: PhysAddr) -> Self {
        let directory = memory.alloc();
        let pde = PageTableEntry::new(kernel_table, KERNEL_PAGE);
        memory.write_u32(entry_addr(directory, 0), pde.raw());
        AddressSpace { memory, directory }
    }

    /// Physical address of the page directory.
    pub fn directory(&self) -> PhysAddr {
        self.directory
    }

    /// Install this address space as the active mapping.
    ///
    /// Callers hold interrupts disabled.
    pub fn activate(&self, machine: &dyn Machine) {
        machine.load_page_directory(self.directory);
    }

    fn pde(&self, index: usize) -> PageTableEntry {
        PageTableEntry::from_raw(self.memory.read_u32(entry_addr(self.directory, index)))
    }

    fn set_pde(&self, index: usize, pde: PageTableEntry) {
        self.memory.write_u32(entry_addr(self.directory, index), pde.raw());
    }

    fn table_entries(&self, table: PhysAddr) -> Vec<PageTableEntry> {
        let mut raw = vec![0u8; FRAME_SIZE as usize];
        self.memory.read(table, &mut raw);
        raw.chunks_exact(4)
            .map(|w| PageTableEntry::from_raw(u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
            .collect()
    }

    /// Page table entry for `va`; empty when no table covers it.
    pub fn entry(&self, va: VirtAddr) -> PageTableEntry {
        let pde = self.pde(pd_index(va));
        if !pde.is_present() {
            return PageTableEntry::empty();
        }
        PageTableEntry::from_raw(self.memory.read_u32(entry_addr(pde.frame(), pt_index(va))))
    }

    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        self.entry(va).is_present()
    }

    /// Map the page containing `va` to frame `pa`.
    pub fn pmap(&self, va: VirtAddr, pa: PhysAddr, flags: PageTableFlags) {
        let pd = pd_index(va);
        if pd == 0 {
            panic!("pmap of {:#010x} into the shared kernel table", va);
        }
        let pde = self.pde(pd);
        let table = if pde.is_present() {
            pde.frame()
        } else {
            let table = self.memory.alloc();
            self.set_pde(pd, PageTableEntry::new(table, USER_PAGE));
            table
        };
        let pte = PageTableEntry::new(pa, flags);
        self.memory.write_u32(entry_addr(table, pt_index(va)), pte.raw());
    }

    /// Back the page containing `va` with a fresh zeroed frame.
    pub fn map_fresh(&self, va: VirtAddr) -> PhysAddr {
        let frame = self.memory.alloc();
        self.pmap(page_base(va), frame, USER_PAGE);
        frame
    }

    /// Map one fresh frame at `va` if it lies in the mmap window.
    pub fn mmap(&self, va: VirtAddr) -> KernelResult<MapOutcome> {
        let page = page_base(va);
        if !(USER_MMAP_BASE..USER_IMAGE_BASE).contains(&page) {
            return Err(KernelError::NotPossible);
        }
        if self.is_mapped(page) {
            return Ok(MapOutcome::AlreadyMapped);
        }
        self.map_fresh(page);
        Ok(MapOutcome::Mapped(page))
    }

    /// Translate `va`, checking presence and permissions like the MMU.
    pub fn translate(&self, va: VirtAddr, access: Access, user: bool) -> Result<PhysAddr, PageFault> {
        let fault = PageFault { va, access };
        let pde = self.pde(pd_index(va));
        if !pde.is_present() || (user && !pde.flags().contains(PageTableFlags::USER_ACCESSIBLE)) {
            return Err(fault);
        }
        let pte = PageTableEntry::from_raw(self.memory.read_u32(entry_addr(pde.frame(), pt_index(va))));
        let flags = pte.flags();
        if !pte.is_present()
            || (user && !flags.contains(PageTableFlags::USER_ACCESSIBLE))
            || (access == Access::Write && !flags.contains(PageTableFlags::WRITABLE))
        {
            return Err(fault);
        }
        Ok(pte.frame() | (va & (FRAME_SIZE - 1)))
    }

    /// Walk `[va, va + len)` page by page, handing each physical chunk
    /// and the matching slice range to `f`.
    fn walk(
        &self,
        va: VirtAddr,
        len: usize,
        access: Access,
        user: bool,
        mut f: impl FnMut(PhysAddr, core::ops::Range<usize>),
    ) -> Result<(), PageFault> {
        if va as u64 + len as u64 > 1 << 32 {
            return Err(PageFault { va: u32::MAX, access });
        }
        let mut done = 0usize;
        while done < len {
            let addr = va + done as u32;
            let in_page = (FRAME_SIZE - (addr & (FRAME_SIZE - 1))) as usize;
            let n = in_page.min(len - done);
            let pa = self.translate(addr, access, user)?;
            f(pa, done..done + n);
            done += n;
        }
        Ok(())
    }

    /// User-mode read. Fails with the first faulting address.
    pub fn read_user(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), PageFault> {
        let memory = &self.memory;
        self.walk(va, buf.len(), Access::Read, true, |pa, r| memory.read(pa, &mut buf[r]))
    }

    /// User-mode write. Fails with the first faulting address.
    pub fn write_user(&self, va: VirtAddr, data: &[u8]) -> Result<(), PageFault> {
        let memory = &self.memory;
        self.walk(va, data.len(), Access::Write, true, |pa, r| memory.write(pa, &data[r]))
    }

    /// Make `[va, va + len)` accessible for a kernel copy on behalf of the
    /// user, growing the image/stack region like a fault would.
    fn prepare_user_range(&self, va: VirtAddr, len: usize) -> KernelResult<()> {
        if va < USER_MMAP_BASE || va as u64 + len as u64 > 1 << 32 {
            return Err(KernelError::BadAddress);
        }
        if len == 0 {
            return Ok(());
        }
        let last = va + (len as u32 - 1);
        let mut page = page_base(va);
        loop {
            if !self.is_mapped(page) && classify_fault(page) == FaultRegion::Growable {
                self.map_fresh(page);
            }
            if page == page_base(last) {
                break;
            }
            page += FRAME_SIZE;
        }
        Ok(())
    }

    /// Kernel write into user memory.
    pub fn copy_out(&self, va: VirtAddr, data: &[u8]) -> KernelResult<()> {
        self.prepare_user_range(va, data.len())?;
        self.write_user(va, data).map_err(|_| KernelError::BadAddress)
    }

    /// Kernel read from user memory. Nothing is mapped on the way.
    pub fn copy_in(&self, va: VirtAddr, buf: &mut [u8]) -> KernelResult<()> {
        if va < USER_MMAP_BASE {
            return Err(KernelError::BadAddress);
        }
        self.read_user(va, buf).map_err(|_| KernelError::BadAddress)
    }

    pub fn read_u32(&self, va: VirtAddr) -> KernelResult<u32> {
        let mut word = [0u8; 4];
        self.copy_in(va, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Read a NUL-terminated string of at most `max` bytes from user memory.
    pub fn read_cstr(&self, va: VirtAddr, max: usize) -> KernelResult<String> {
        let mut bytes = Vec::new();
        for i in 0..max {
            let mut b = [0u8; 1];
            self.copy_in(va.checked_add(i as u32).ok_or(KernelError::BadAddress)?, &mut b)?;
            if b[0] == 0 {
                return String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument);
            }
            bytes.push(b[0]);
        }
        Err(KernelError::InvalidArgument)
    }

    /// Copy every present user page into `child`, frame by frame.
    pub fn fork(&self, child: &AddressSpace) {
        for pd in 1..ENTRIES_PER_TABLE {
            let pde = self.pde(pd);
            if !pde.is_present() {
                continue;
            }
            for (pt, pte) in self.table_entries(pde.frame()).into_iter().enumerate() {
                if !pte.is_present() {
                    continue;
                }
                let frame = child.memory.alloc();
                self.memory.copy_frame(pte.frame(), frame);
                child.pmap(va_of(pd, pt), frame, pte.flags());
            }
        }
    }

    /// Unmap and free every user page and table, leaving the kernel window.
    pub fn exec(&self) {
        for pd in 1..ENTRIES_PER_TABLE {
            let pde = self.pde(pd);
            if !pde.is_present() {
                continue;
            }
            for pte in self.table_entries(pde.frame()) {
                if pte.is_present() {
                    self.memory.free(pte.frame());
                }
            }
            self.memory.free(pde.frame());
            self.set_pde(pd, PageTableEntry::empty());
        }
    }

    /// Number of present user pages.
    pub fn user_pages(&self) -> usize {
        (1..ENTRIES_PER_TABLE)
            .map(|pd| self.pde(pd))
            .filter(|pde| pde.is_present())
            .map(|pde| self.table_entries(pde.frame()).iter().filter(|e| e.is_present()).count())
            .sum()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.exec();
        self.memory.free(self.directory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PHYS_MEM_SIZE, PHYS_RESERVED};

    fn setup() -> (Arc<PhysMem>, PhysAddr) {
        let memory = Arc::new(PhysMem::new(PHYS_MEM_SIZE, PHYS_RESERVED));
        let kernel_table = AddressSpace::build_kernel_table(&memory);
        (memory, kernel_table)
    }

    #[test]
    fn test_kernel_window_shared_and_supervisor_only() {
        let (memory, kt) = setup();
        let a = AddressSpace::new(memory.clone(), kt);
        let b = AddressSpace::new(memory.clone(), kt);
        let va = 0x0020_0000;
        assert_eq!(a.translate(va, Access::Read, false), Ok(va));
        assert_eq!(b.translate(va, Access::Read, false), Ok(va));
        assert!(a.translate(va, Access::Read, true).is_err());
        assert!(!a.is_mapped(0));
    }

    #[test]
    fn test_mmap_outcomes() {
        let (memory, kt) = setup();
        let space = AddressSpace::new(memory, kt);
        assert_eq!(space.mmap(0x0050_0123), Ok(MapOutcome::Mapped(0x0050_0000)));
        assert_eq!(space.mmap(0x0050_0000), Ok(MapOutcome::AlreadyMapped));
        assert_eq!(space.mmap(0x0000_2000), Err(KernelError::NotPossible));
        assert_eq!(space.mmap(0x8000_0000), Err(KernelError::NotPossible));
        assert_eq!(space.user_pages(), 1);
    }

    #[test]
    fn test_user_access_faults_on_unmapped() {
        let (memory, kt) = setup();
        let space = AddressSpace::new(memory, kt);
        let fault = space.write_user(0x0060_0ffe, b"abcd").unwrap_err();
        assert_eq!(fault.va, 0x0060_0ffe);
        space.mmap(0x0060_0000).unwrap();
        // The second page is still missing.
        let fault = space.write_user(0x0060_0ffe, b"abcd").unwrap_err();
        assert_eq!(fault.va, 0x0060_1000);
        space.mmap(0x0060_1000).unwrap();
        space.write_user(0x0060_0ffe, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        space.read_user(0x0060_0ffe, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_copy_out_grows_image_region_only() {
        let (memory, kt) = setup();
        let space = AddressSpace::new(memory, kt);
        space.copy_out(0xFFFF_F000, b"stack").unwrap();
        assert!(space.is_mapped(0xFFFF_F000));
        assert_eq!(space.copy_out(0x0070_0000, b"heap"), Err(KernelError::BadAddress));
        assert_eq!(space.copy_out(0x0000_3000, b"kernel"), Err(KernelError::BadAddress));
    }

    #[test]
    fn test_read_cstr() {
        let (memory, kt) = setup();
        let space = AddressSpace::new(memory, kt);
        space.copy_out(0x8000_0ffc, b"/bin/sh\0").unwrap();
        assert_eq!(space.read_cstr(0x8000_0ffc, 64).unwrap(), "/bin/sh");
        assert_eq!(space.read_cstr(0x8000_0ffc, 4), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_fork_copies_not_shares() {
        let (memory, kt) = setup();
        let parent = AddressSpace::new(memory.clone(), kt);
        parent.copy_out(0x8000_1000, b"parent").unwrap();
        parent.mmap(0x0040_0000).unwrap();
        let child = AddressSpace::new(memory.clone(), kt);
        parent.fork(&child);
        assert_eq!(child.user_pages(), 2);

        child.copy_out(0x8000_1000, b"child!").unwrap();
        let mut buf = [0u8; 6];
        parent.copy_in(0x8000_1000, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
        child.copy_in(0x8000_1000, &mut buf).unwrap();
        assert_eq!(&buf, b"child!");
    }

    #[test]
    fn test_exec_and_drop_release_frames() {
        let (memory, kt) = setup();
        let baseline = memory.frames_in_use();
        let space = AddressSpace::new(memory.clone(), kt);
        space.copy_out(0x8000_0000, &[1u8; 3 * FRAME_SIZE as usize]).unwrap();
        space.mmap(0x0100_0000).unwrap();
        assert!(memory.frames_in_use() > baseline + 4);

        space.exec();
        assert_eq!(space.user_pages(), 0);
        // Only the directory remains.
        assert_eq!(memory.frames_in_use(), baseline + 1);
        assert!(space.translate(0x0010_0000, Access::Read, false).is_ok());

        drop(space);
        assert_eq!(memory.frames_in_use(), baseline);
    }

    #[test]
    fn test_fault_regions() {
        assert_eq!(classify_fault(0), FaultRegion::NullGuard);
        assert_eq!(classify_fault(0xfff), FaultRegion::NullGuard);
        assert_eq!(classify_fault(0x1000), FaultRegion::KernelWindow);
        assert_eq!(classify_fault(0x003F_FFFF), FaultRegion::KernelWindow);
        assert_eq!(classify_fault(0x0040_0000), FaultRegion::MmapWindow);
        assert_eq!(classify_fault(0x7FFF_FFFF), FaultRegion::MmapWindow);
        assert_eq!(classify_fault(0x8000_0000), FaultRegion::Growable);
        assert_eq!(classify_fault(0xFFFF_FFFF), FaultRegion::Growable);
    }
}
