//! Kestrel Kernel Core
//!
//! The execution core of a small uniprocessor kernel: processes on real
//! kernel stacks, a round-robin scheduler with a nested interrupt-disable
//! discipline, timers and alarms, queued signals delivered through user
//! handler frames, and per-process two-level address spaces with demand
//! paging.
//!
//! Hardware is reached only through [`hal::Machine`]. [`hal::SimMachine`]
//! implements it over simulated physical memory so the whole core runs
//! under `cargo test`.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod fs;
pub mod hal;
pub mod logger;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod sync;
pub mod syscall;

#[cfg(test)]
mod tests;

pub use config::KernelConfig;
pub use error::{KernelError, KernelResult};
pub use hal::{Machine, SimMachine};
pub use process::{Process, ProcessId, ProcessState, Regs, Signal};
pub use scheduler::{Kernel, KernelStats};
