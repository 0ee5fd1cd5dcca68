//! POSIX shared memory wrapper

use crate::{Error, Result};
use nix::errno::Errno;
use nix::sys::mman;
use shared_memory::{Shmem, ShmemConf, ShmemError};

/// Shared memory region mapped into this process
///
/// A region returned by [`SharedMemory::create`] unlinks its name when dropped
/// until [`SharedMemory::persist`] is called, so a half-built queue never
/// outlives a failed setup.
pub struct SharedMemory {
    inner: Shmem,
    name: String,
    size: usize,
}

// Safety: the mapping is process-wide; concurrent access is serialized by the
// queue's mutex semaphore
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new shared memory region, failing if the name is taken
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let mut shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| match e {
                ShmemError::MappingIdExists => Error::AlreadyExists(name.to_string()),
                e => Error::SharedMemory(format!("create {}: {}", name, e)),
            })?;
        shmem.set_owner(true);

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    /// Open an existing shared memory region
    pub fn open(name: &str) -> Result<Self> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| match e {
                ShmemError::MapOpenFailed(code) if code == Errno::ENOENT as u32 => {
                    Error::NotFound(name.to_string())
                }
                e => Error::SharedMemory(format!("open {}: {}", name, e)),
            })?;

        let size = shmem.len();

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    /// Keep the name alive after this mapping is dropped
    pub fn persist(&mut self) {
        self.inner.set_owner(false);
    }

    /// Remove a shared memory name from the OS namespace
    ///
    /// Returns `Ok(false)` when nothing with that name exists.
    pub fn unlink(name: &str) -> Result<bool> {
        match mman::shm_unlink(name) {
            Ok(()) => Ok(true),
            Err(Errno::ENOENT) => Ok(false),
            Err(e) => Err(Error::Unlink {
                name: name.to_string(),
                source: e.into(),
            }),
        }
    }

    /// Get the name of the shared memory region
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of the shared memory region
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get a raw pointer to the shared memory
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/shmq_shm_{}_{}", std::process::id(), ts)
    }

    #[test]
    fn test_create_open_unlink() {
        let name = unique_name();
        let mut created = SharedMemory::create(&name, 4096).unwrap();
        created.persist();
        unsafe { *created.as_ptr() = 0xAB };

        let opened = SharedMemory::open(&name).unwrap();
        assert!(opened.size() >= 4096);
        assert_eq!(unsafe { *opened.as_ptr() }, 0xAB);

        assert!(matches!(
            SharedMemory::create(&name, 4096),
            Err(Error::AlreadyExists(_))
        ));

        drop(created);
        drop(opened);
        assert!(SharedMemory::unlink(&name).unwrap());
        assert!(!SharedMemory::unlink(&name).unwrap());
    }

    #[test]
    fn test_unpersisted_region_is_removed_on_drop() {
        let name = unique_name();
        drop(SharedMemory::create(&name, 1024).unwrap());
        assert!(matches!(SharedMemory::open(&name), Err(Error::NotFound(_))));
    }
}
