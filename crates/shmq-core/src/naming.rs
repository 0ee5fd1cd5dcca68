//! Queue name validation and semaphore name derivation
//!
//! A queue name is used verbatim as the shared memory object name. The two
//! semaphores guarding the queue are named after it: one leading `/` is
//! stripped, the rest is cut to [`SEM_BASE_MAX`] bytes and a fixed suffix is
//! appended. macOS rejects semaphore names longer than 31 bytes including the
//! terminator, so derived names never exceed [`SEM_NAME_MAX`].

use crate::{Error, Result};

/// Longest prefix of the queue name kept in a semaphore name
pub const SEM_BASE_MAX: usize = 24;

/// Longest semaphore name accepted by every supported platform
pub const SEM_NAME_MAX: usize = 30;

/// Suffix of the mutual exclusion semaphore
pub const MUTEX_SUFFIX: &str = "_mutex";

/// Suffix of the item counting semaphore
pub const ITEMS_SUFFIX: &str = "_items";

/// Check that `name` can be used as a queue name.
///
/// Runs before any OS resource is touched.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_name(name, "name is empty"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(Error::invalid_name(name, "name contains whitespace"));
    }
    if name.contains('\0') {
        return Err(Error::invalid_name(name, "name contains a NUL byte"));
    }
    Ok(())
}

/// Derive the semaphore name for `queue_name` with the given suffix.
pub fn sem_name(queue_name: &str, suffix: &str) -> Result<String> {
    let base = queue_name.strip_prefix('/').unwrap_or(queue_name);
    if base.is_empty() {
        return Err(Error::invalid_name(
            queue_name,
            "name has nothing left to derive semaphore names from",
        ));
    }

    let mut cut = base.len().min(SEM_BASE_MAX);
    while !base.is_char_boundary(cut) {
        cut -= 1;
    }

    let derived = format!("{}{}", &base[..cut], suffix);
    if derived.len() > SEM_NAME_MAX {
        return Err(Error::invalid_name(
            queue_name,
            "derived semaphore name exceeds the platform limit",
        ));
    }
    Ok(derived)
}

/// Both semaphore names of a queue, `(mutex, items)`.
pub fn sem_names(queue_name: &str) -> Result<(String, String)> {
    Ok((
        sem_name(queue_name, MUTEX_SUFFIX)?,
        sem_name(queue_name, ITEMS_SUFFIX)?,
    ))
}
