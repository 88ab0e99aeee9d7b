//! Process Management
//!
//! The process control block, its resource table and signal state, and
//! the program-loading paths (fork, execv).

pub mod context;
pub mod elf;
pub mod exec;
pub mod frame;
pub mod process;
pub mod resource;
pub mod signal;

pub use context::{Regs, TrapState, UserContext};
pub use process::{Process, ProcessBody, ProcessId, ProcessState};
pub use resource::{Handle, Resource, ResourceTable};
pub use signal::{Disposition, Signal, SignalState};
