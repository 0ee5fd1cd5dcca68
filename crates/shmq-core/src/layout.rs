//! Control block stored at the start of every queue segment

use crate::{Error, Result};

/// Capacity of each semaphore name field, terminator included
pub const NAME_LEN: usize = 128;

/// Header of the shared segment
///
/// Plain data only: every process maps the same bytes, so nothing here may
/// own memory or hold process-local handles. The data region starts
/// [`ControlBlock::SIZE`] bytes into the segment.
#[repr(C, align(64))]
pub struct ControlBlock {
    /// Number of slots, fixed at creation
    pub max_elements: usize,
    /// Bytes per slot, fixed at creation
    pub element_size: usize,
    /// Next slot to write
    pub head: usize,
    /// Next slot to read
    pub tail: usize,
    /// Occupied slots
    pub count: usize,
    /// Mutex semaphore name (NUL-terminated)
    pub mutex_name: [u8; NAME_LEN],
    /// Items semaphore name (NUL-terminated)
    pub items_name: [u8; NAME_LEN],
}

impl ControlBlock {
    /// Size of ControlBlock in bytes
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Total segment size for the given geometry.
    pub fn segment_size(max_elements: usize, element_size: usize) -> Result<usize> {
        if max_elements == 0 || element_size == 0 {
            return Err(Error::InvalidCapacity);
        }
        let overflow = || Error::CapacityOverflow {
            max_elements,
            element_size,
        };
        let data = max_elements.checked_mul(element_size).ok_or_else(overflow)?;
        Self::SIZE.checked_add(data).ok_or_else(overflow)
    }

    /// Reset the header of a freshly created segment.
    pub fn init(&mut self, max_elements: usize, element_size: usize) {
        self.max_elements = max_elements;
        self.element_size = element_size;
        self.head = 0;
        self.tail = 0;
        self.count = 0;
        self.mutex_name = [0; NAME_LEN];
        self.items_name = [0; NAME_LEN];
    }

    /// Record the semaphore names for later `open` calls.
    pub fn set_sem_names(&mut self, mutex: &str, items: &str) -> Result<()> {
        write_name(&mut self.mutex_name, mutex)?;
        write_name(&mut self.items_name, items)
    }

    pub fn mutex_name(&self) -> Result<&str> {
        read_name(&self.mutex_name)
    }

    pub fn items_name(&self) -> Result<&str> {
        read_name(&self.items_name)
    }

    /// Check a header read from an existing segment of `mapped_len` bytes.
    pub fn validate(&self, mapped_len: usize) -> Result<()> {
        let needed = Self::segment_size(self.max_elements, self.element_size).map_err(|e| {
            Error::Corrupted(format!("bad geometry: {}", e))
        })?;
        if needed > mapped_len {
            return Err(Error::Corrupted(format!(
                "segment holds {} bytes but geometry needs {}",
                mapped_len, needed
            )));
        }
        if self.head >= self.max_elements
            || self.tail >= self.max_elements
            || self.count > self.max_elements
        {
            return Err(Error::Corrupted(format!(
                "ring indices out of range: head={} tail={} count={} capacity={}",
                self.head, self.tail, self.count, self.max_elements
            )));
        }
        Ok(())
    }

    /// Claim the slot for the next push.
    ///
    /// Returns the slot index and whether the oldest element was evicted to
    /// make room.
    #[inline]
    pub fn claim_head(&mut self) -> (usize, bool) {
        let evicted = self.count >= self.max_elements;
        if evicted {
            self.tail = (self.tail + 1) % self.max_elements;
            self.count -= 1;
        }
        let slot = self.head;
        self.head = (self.head + 1) % self.max_elements;
        self.count += 1;
        (slot, evicted)
    }

    /// Release the oldest slot and return its index.
    ///
    /// Callers must hold an items permit, which guarantees `count > 0`.
    #[inline]
    pub fn release_tail(&mut self) -> usize {
        debug_assert!(self.count > 0);
        let slot = self.tail;
        self.tail = (self.tail + 1) % self.max_elements;
        self.count -= 1;
        slot
    }
}

fn write_name(dst: &mut [u8; NAME_LEN], name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.len() >= NAME_LEN {
        return Err(Error::invalid_name(
            name,
            "semaphore name does not fit the control block",
        ));
    }
    dst.fill(0);
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn read_name(src: &[u8; NAME_LEN]) -> Result<&str> {
    let end = src
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Corrupted("semaphore name is not terminated".to_string()))?;
    if end == 0 {
        return Err(Error::Corrupted("semaphore name is empty".to_string()));
    }
    std::str::from_utf8(&src[..end])
        .map_err(|_| Error::Corrupted("semaphore name is not UTF-8".to_string()))
}
