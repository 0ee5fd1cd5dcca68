//! shmq - Cross-process fixed-size record queue over shared memory
//!
//! A [`Queue`] is a ring of `max_elements` slots of `element_size` bytes in a
//! POSIX shared memory object, guarded by two named semaphores. Pushing into
//! a full queue drops the oldest record.

pub mod borrow;
pub mod error;
pub mod layout;
pub mod naming;
pub mod queue;
pub mod sem;
pub mod shm;

pub use borrow::Borrowed;
pub use error::{Error, Result};
pub use layout::ControlBlock;
pub use queue::Queue;
