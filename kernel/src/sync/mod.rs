//! Blocking synchronization primitives built on the scheduler's
//! wait queues.

pub mod event;
pub mod semaphore;
pub mod wait_queue;

pub use event::Completion;
pub use semaphore::Semaphore;
pub use wait_queue::WaitQueue;
