//! POSIX named semaphore wrapper

use crate::{Error, Result};
use log::warn;
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

/// Handle to a named semaphore opened by this process
///
/// Dropping the handle closes it; the semaphore itself stays in the OS
/// namespace until [`Semaphore::unlink`].
pub struct Semaphore {
    sem: NonNull<libc::sem_t>,
    name: String,
}

// Safety: sem_t operations are thread-safe and the handle is only closed on drop
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Create a new semaphore with `initial` permits, failing if it exists
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let c_name = c_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o666 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        Self::from_raw(sem, name, "sem_open(create)")
    }

    /// Open an existing semaphore
    pub fn open(name: &str) -> Result<Self> {
        let c_name = c_name(name)?;
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        Self::from_raw(sem, name, "sem_open")
    }

    fn from_raw(sem: *mut libc::sem_t, name: &str, op: &'static str) -> Result<Self> {
        if sem == libc::SEM_FAILED {
            return Err(Error::Semaphore {
                name: name.to_string(),
                op,
                source: io::Error::last_os_error(),
            });
        }
        let sem = NonNull::new(sem).ok_or_else(|| Error::Semaphore {
            name: name.to_string(),
            op,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        })?;
        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    /// Remove a semaphore name from the OS namespace
    ///
    /// Returns `Ok(false)` when no semaphore with that name exists.
    pub fn unlink(name: &str) -> Result<bool> {
        let c_name = c_name(name)?;
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(false)
        } else {
            Err(Error::Unlink {
                name: name.to_string(),
                source: err,
            })
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until a permit is available, retrying on `EINTR`
    pub fn wait(&self) -> Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(self.error("sem_wait", err));
            }
        }
    }

    /// Take a permit if one is available without blocking
    pub fn try_wait(&self) -> Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(self.error("sem_trywait", err)),
            }
        }
    }

    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(self.error("sem_post", io::Error::last_os_error()))
        }
    }

    /// Wait and return a guard that posts the permit back on drop
    pub fn lock(&self) -> Result<SemGuard<'_>> {
        self.wait()?;
        Ok(SemGuard { sem: self })
    }

    fn error(&self, op: &'static str, source: io::Error) -> Error {
        Error::Semaphore {
            name: self.name.clone(),
            op,
            source,
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
    }
}

/// Held permit of a binary semaphore
pub struct SemGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.post() {
            warn!("failed to release {}: {}", self.sem.name(), e);
        }
    }
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::invalid_name(name, "name contains a NUL byte"))
}
