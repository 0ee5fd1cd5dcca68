//! RAII view of a borrowed queue slot

use crate::queue::Queue;
use log::warn;
use std::mem;
use std::ops::Deref;
use std::ptr::NonNull;

/// Record popped with [`Queue::borrow`] and read in place
///
/// Dropping the view calls [`Queue::commit_pop`] for its slot. The slot has
/// already left the queue, so a producer that wraps the ring can overwrite
/// these bytes while the view is alive.
pub struct Borrowed<'a> {
    queue: &'a Queue,
    ptr: NonNull<u8>,
    index: usize,
    len: usize,
}

impl<'a> Borrowed<'a> {
    pub(crate) fn new(queue: &'a Queue, ptr: NonNull<u8>, index: usize, len: usize) -> Self {
        Self {
            queue,
            ptr,
            index,
            len,
        }
    }

    /// Slot index within the ring
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Release the slot now
    pub fn commit(self) {
        drop(self)
    }

    /// Give up the guard and keep the raw slot pointer and index
    ///
    /// The caller takes over the `commit_pop(index)` call. The pointer is
    /// valid for `element_size` bytes while the queue handle stays open.
    pub fn into_raw(self) -> (NonNull<u8>, usize) {
        let raw = (self.ptr, self.index);
        mem::forget(self);
        raw
    }
}

impl Deref for Borrowed<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Borrowed<'_> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for Borrowed<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.queue.commit_pop(self.index) {
            warn!("commit_pop {}: {}", self.index, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Queue;

    #[test]
    fn test_into_raw_hands_over_commit() {
        let name = format!("/sqb{}", std::process::id() % 100_000);
        let _ = Queue::destroy(&name);
        let q = Queue::create(&name, 2, 4).unwrap();
        q.push(&[5, 6, 7, 8]).unwrap();

        let (ptr, index) = q.borrow().unwrap().unwrap().into_raw();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 4) };
        assert_eq!(bytes, &[5, 6, 7, 8]);
        assert_eq!(index, 0);
        q.commit_pop(index).unwrap();

        drop(q);
        Queue::destroy(&name).unwrap();
    }
}
