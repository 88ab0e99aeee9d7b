//! Memory management subsystem.
//!
//! # Components
//!
//! - **PhysMem**: simulated physical memory and its frame allocator
//! - **Paging**: 32-bit two-level page table entries
//! - **AddressSpace**: per-process page directory with demand paging,
//!   fork copy and exec teardown

pub mod address_space;
pub mod frame;
pub mod paging;

pub use address_space::{classify_fault, Access, AddressSpace, FaultRegion, MapOutcome, PageFault};
pub use frame::PhysMem;

/// Physical address in simulated memory.
pub type PhysAddr = u32;

/// 32-bit user/kernel virtual address.
pub type VirtAddr = u32;
