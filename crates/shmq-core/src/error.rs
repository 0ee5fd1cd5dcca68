//! Error types for shmq

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid queue name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid queue geometry: max_elements and element_size must be non-zero")]
    InvalidCapacity,

    #[error("queue size overflow: {max_elements} elements of {element_size} bytes")]
    CapacityOverflow {
        max_elements: usize,
        element_size: usize,
    },

    #[error("queue already exists: {0}")]
    AlreadyExists(String),

    #[error("queue not found: {0}")]
    NotFound(String),

    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("semaphore {name}: {op} failed: {source}")]
    Semaphore {
        name: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to unlink {name}: {source}")]
    Unlink {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("corrupted control block: {0}")]
    Corrupted(String),

    #[error("record size mismatch: expected at least {expected} bytes, got {actual}")]
    RecordSize { expected: usize, actual: usize },

    #[error("queue not initialized")]
    NotInitialized,
}

impl Error {
    pub(crate) fn invalid_name(name: &str, reason: &'static str) -> Self {
        Error::InvalidName {
            name: name.to_string(),
            reason,
        }
    }

    /// Returns the raw OS error code behind this error, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Semaphore { source, .. } | Error::Unlink { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
