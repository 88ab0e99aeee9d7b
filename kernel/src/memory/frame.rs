//! Physical frame allocator.
//!
//! Physical memory is a flat byte array. Frames below the reserved
//! boundary are never handed out. Fresh frames come from a bump pointer,
//! released frames go onto a free list that is consumed first (LIFO).
//!
//! Running out of frames is unrecoverable: [`PhysMem::alloc`] panics.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::FRAME_SIZE;
use crate::memory::PhysAddr;

/// Simulated physical memory plus its frame allocator.
pub struct PhysMem {
    inner: Mutex<FrameState>,
}

struct FrameState {
    bytes: Vec<u8>,
    /// Next never-used frame.
    bump: PhysAddr,
    /// Released frames, most recent last.
    free: Vec<PhysAddr>,
    in_use: usize,
}

impl FrameState {
    fn range(&self, pa: PhysAddr, len: usize) -> core::ops::Range<usize> {
        let start = pa as usize;
        let end = start + len;
        if end > self.bytes.len() {
            panic!(
                "physical access {:#010x}+{:#x} beyond end of memory {:#010x}",
                pa,
                len,
                self.bytes.len()
            );
        }
        start..end
    }
}

impl PhysMem {
    /// Create `size` bytes of physical memory with `reserved` low bytes
    /// kept out of the allocator.
    pub fn new(size: u32, reserved: u32) -> Self {
        PhysMem {
            inner: Mutex::new(FrameState {
                bytes: vec![0; size as usize],
                bump: reserved,
                free: Vec::new(),
                in_use: 0,
            }),
        }
    }

    /// Bytes of physical memory.
    pub fn size(&self) -> u32 {
        self.inner.lock().bytes.len() as u32
    }

    /// Allocate one zeroed frame, or `None` when memory is exhausted.
    pub fn try_alloc(&self) -> Option<PhysAddr> {
        let mut state = self.inner.lock();
        let pa = match state.free.pop() {
            Some(pa) => pa,
            None => {
                let pa = state.bump;
                if pa as usize + FRAME_SIZE as usize > state.bytes.len() {
                    return None;
                }
                state.bump += FRAME_SIZE;
                pa
            }
        };
        let range = state.range(pa, FRAME_SIZE as usize);
        state.bytes[range].fill(0);
        state.in_use += 1;
        Some(pa)
    }

    /// Allocate one zeroed frame.
    pub fn alloc(&self) -> PhysAddr {
        match self.try_alloc() {
            Some(pa) => pa,
            None => panic!("no more frames ({} in use)", self.frames_in_use()),
        }
    }

    /// Return a frame to the allocator.
    pub fn free(&self, pa: PhysAddr) {
        let mut state = self.inner.lock();
        if pa % FRAME_SIZE != 0 || pa >= state.bump {
            panic!("freeing frame {:#010x} that was never allocated", pa);
        }
        debug_assert!(!state.free.contains(&pa), "double free of frame {:#010x}", pa);
        state.free.push(pa);
        state.in_use -= 1;
    }

    /// Frames currently handed out.
    pub fn frames_in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    /// Frames that can still be allocated.
    pub fn free_frames(&self) -> usize {
        let state = self.inner.lock();
        let untouched = (state.bytes.len() as u32 - state.bump) / FRAME_SIZE;
        state.free.len() + untouched as usize
    }

    pub fn read(&self, pa: PhysAddr, buf: &mut [u8]) {
        let state = self.inner.lock();
        let range = state.range(pa, buf.len());
        buf.copy_from_slice(&state.bytes[range]);
    }

    pub fn write(&self, pa: PhysAddr, data: &[u8]) {
        let mut state = self.inner.lock();
        let range = state.range(pa, data.len());
        state.bytes[range].copy_from_slice(data);
    }

    pub fn read_u32(&self, pa: PhysAddr) -> u32 {
        let mut word = [0u8; 4];
        self.read(pa, &mut word);
        u32::from_le_bytes(word)
    }

    pub fn write_u32(&self, pa: PhysAddr, value: u32) {
        self.write(pa, &value.to_le_bytes());
    }

    /// Copy a whole frame.
    pub fn copy_frame(&self, src: PhysAddr, dst: PhysAddr) {
        let mut state = self.inner.lock();
        let from = state.range(src, FRAME_SIZE as usize);
        let to = state.range(dst, FRAME_SIZE as usize);
        state.bytes.copy_within(from, to.start);
    }
}
