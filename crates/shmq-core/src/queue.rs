//! Shared memory ring queue

use crate::borrow::Borrowed;
use crate::layout::ControlBlock;
use crate::naming;
use crate::sem::{SemGuard, Semaphore};
use crate::shm::SharedMemory;
use crate::{Error, Result};
use log::{debug, trace, warn};
use std::fmt;
use std::ptr::{self, NonNull};

/// Fixed-size record queue shared between processes
///
/// Each process attaches with [`Queue::create`] or [`Queue::open`] and gets
/// its own handle. The segment and its semaphores outlive every handle and
/// are only removed by [`Queue::destroy`].
pub struct Queue {
    name: String,
    inner: Option<Attached>,
}

/// Resources held by an attached handle
///
/// Field order is drop order: semaphores are closed before the segment is
/// unmapped.
struct Attached {
    mutex: Semaphore,
    items: Semaphore,
    shm: SharedMemory,
    max_elements: usize,
    element_size: usize,
}

impl Queue {
    /// Create a new queue with `max_elements` slots of `element_size` bytes
    ///
    /// Fails if a queue with this name already exists. Nothing is left in
    /// the OS namespace when creation fails.
    pub fn create(name: &str, max_elements: usize, element_size: usize) -> Result<Self> {
        naming::validate_name(name)?;
        let (mutex_name, items_name) = naming::sem_names(name)?;
        let size = ControlBlock::segment_size(max_elements, element_size)?;

        // Unlinked again on drop until persisted below
        let mut shm = SharedMemory::create(name, size)?;

        let cb = unsafe { &mut *(shm.as_ptr() as *mut ControlBlock) };
        cb.init(max_elements, element_size);
        cb.set_sem_names(&mutex_name, &items_name)?;

        clear_stale(&mutex_name);
        clear_stale(&items_name);

        let mutex = Semaphore::create(&mutex_name, 1).map_err(|e| {
            warn!("create {}: {}, removing segment", name, e);
            e
        })?;
        let items = match Semaphore::create(&items_name, 0) {
            Ok(items) => items,
            Err(e) => {
                warn!("create {}: {}, removing segment", name, e);
                drop(mutex);
                if let Err(unlink) = Semaphore::unlink(&mutex_name) {
                    warn!("{}", unlink);
                }
                return Err(e);
            }
        };

        shm.persist();
        debug!(
            "created queue {} ({} x {} bytes, {} byte segment)",
            name, max_elements, element_size, size
        );

        Ok(Self {
            name: name.to_string(),
            inner: Some(Attached {
                mutex,
                items,
                shm,
                max_elements,
                element_size,
            }),
        })
    }

    /// Attach to an existing queue
    pub fn open(name: &str) -> Result<Self> {
        naming::validate_name(name)?;
        let shm = SharedMemory::open(name)?;
        if shm.size() < ControlBlock::SIZE {
            return Err(Error::Corrupted(format!(
                "segment {} is {} bytes, smaller than its header",
                name,
                shm.size()
            )));
        }

        let cb = shm.as_ptr() as *const ControlBlock;
        // Geometry and semaphore names are written once before the
        // semaphores exist and never change afterwards.
        let (max_elements, element_size, mutex_name, items_name) = unsafe {
            let cb = &*cb;
            (
                cb.max_elements,
                cb.element_size,
                cb.mutex_name()?.to_string(),
                cb.items_name()?.to_string(),
            )
        };

        let mutex = Semaphore::open(&mutex_name).map_err(|e| {
            warn!("open {}: {}", name, e);
            e
        })?;
        let items = Semaphore::open(&items_name).map_err(|e| {
            warn!("open {}: {}", name, e);
            e
        })?;

        let attached = Attached {
            mutex,
            items,
            shm,
            max_elements,
            element_size,
        };
        {
            let _guard = attached.mutex.lock()?;
            unsafe { &*cb }.validate(attached.shm.size())?;
        }

        debug!(
            "opened queue {} ({} x {} bytes)",
            name, max_elements, element_size
        );

        Ok(Self {
            name: name.to_string(),
            inner: Some(attached),
        })
    }

    /// Remove a queue and its semaphores from the OS namespace
    ///
    /// Succeeds when the queue does not exist. Handles already attached in
    /// other processes keep working on their mapping.
    pub fn destroy(name: &str) -> Result<()> {
        naming::validate_name(name)?;
        let (mutex_name, items_name) = naming::sem_names(name)?;

        if !SharedMemory::unlink(name)? {
            debug!("destroy {}: no such queue", name);
            return Ok(());
        }
        let mutex = Semaphore::unlink(&mutex_name);
        let items = Semaphore::unlink(&items_name);
        mutex?;
        items?;

        debug!("destroyed queue {}", name);
        Ok(())
    }

    /// Push a record, evicting the oldest one if the queue is full
    ///
    /// Copies the first `element_size` bytes of `record`. Returns `false`
    /// when an unread record was dropped to make room.
    pub fn push(&self, record: &[u8]) -> Result<bool> {
        let q = self.attached()?;
        q.check_len(record.len())?;

        let _guard = q.mutex.lock()?;
        let cb = unsafe { q.control() };
        let (slot, evicted) = cb.claim_head();

        unsafe {
            ptr::copy_nonoverlapping(record.as_ptr(), q.slot_ptr(slot), q.element_size);
        }
        // Eviction keeps occupancy, and with it the item permits, unchanged
        if evicted {
            trace!("push {}: dropped oldest record", self.name);
        } else {
            q.items.post()?;
        }

        Ok(!evicted)
    }

    /// Pop the oldest record into `buffer`, blocking until one is available
    pub fn pop(&self, buffer: &mut [u8]) -> Result<()> {
        let q = self.attached()?;
        q.check_len(buffer.len())?;

        q.items.wait()?;
        q.copy_out(buffer)
    }

    /// Pop the oldest record into `buffer` if there is one
    ///
    /// Returns `false` without touching the queue when it is empty.
    pub fn try_pop(&self, buffer: &mut [u8]) -> Result<bool> {
        let q = self.attached()?;
        q.check_len(buffer.len())?;

        if !q.items.try_wait()? {
            return Ok(false);
        }
        q.copy_out(buffer)?;
        Ok(true)
    }

    /// Pop the oldest record without copying it
    ///
    /// The slot is removed from the queue before this returns; the returned
    /// view reads it in place. Its bytes stay intact only until producers
    /// push enough records to wrap the ring back onto the slot.
    pub fn borrow(&self) -> Result<Option<Borrowed<'_>>> {
        let q = self.attached()?;
        if !q.items.try_wait()? {
            return Ok(None);
        }

        let slot = {
            let _guard = q.lock_claimed()?;
            unsafe { q.control() }.release_tail()
        };
        let ptr = NonNull::new(q.slot_ptr(slot))
            .ok_or_else(|| Error::Corrupted("null slot pointer".to_string()))?;

        Ok(Some(Borrowed::new(self, ptr, slot, q.element_size)))
    }

    /// Mark a borrowed slot as no longer in use
    ///
    /// The ring already advanced in [`Queue::borrow`], so this changes no
    /// queue state.
    pub fn commit_pop(&self, index: usize) -> Result<()> {
        let q = self.attached()?;
        if index >= q.max_elements {
            return Err(Error::Corrupted(format!(
                "slot {} out of range for {} ({} slots)",
                index, self.name, q.max_elements
            )));
        }
        trace!("commit_pop {}: slot {}", self.name, index);
        Ok(())
    }

    /// Number of records currently queued
    pub fn len(&self) -> Result<usize> {
        let q = self.attached()?;
        let _guard = q.mutex.lock()?;
        Ok(unsafe { q.control() }.count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Detach from the queue
    ///
    /// Unmaps the segment and closes the semaphores without removing them.
    /// Later operations on this handle fail with [`Error::NotInitialized`].
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            debug!("closed queue {}", self.name);
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Get maximum number of elements (0 once closed)
    pub fn max_elements(&self) -> usize {
        self.inner.as_ref().map_or(0, |q| q.max_elements)
    }

    /// Get element size in bytes (0 once closed)
    pub fn element_size(&self) -> usize {
        self.inner.as_ref().map_or(0, |q| q.element_size)
    }

    /// Get queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn attached(&self) -> Result<&Attached> {
        self.inner.as_ref().ok_or(Error::NotInitialized)
    }

    #[cfg(test)]
    pub(crate) fn indices(&self) -> (usize, usize, usize) {
        let q = self.attached().unwrap();
        let _guard = q.mutex.lock().unwrap();
        let cb = unsafe { q.control() };
        (cb.head, cb.tail, cb.count)
    }
}

impl Attached {
    /// Control block of the mapped segment
    ///
    /// Safety: the caller must hold the mutex for as long as the reference
    /// is used.
    #[allow(clippy::mut_from_ref)]
    unsafe fn control(&self) -> &mut ControlBlock {
        &mut *(self.shm.as_ptr() as *mut ControlBlock)
    }

    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < self.max_elements);
        unsafe {
            self.shm
                .as_ptr()
                .add(ControlBlock::SIZE + slot * self.element_size)
        }
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len < self.element_size {
            return Err(Error::RecordSize {
                expected: self.element_size,
                actual: len,
            });
        }
        Ok(())
    }

    /// Take the mutex after an items permit was consumed
    ///
    /// Gives the permit back if the mutex cannot be taken.
    fn lock_claimed(&self) -> Result<SemGuard<'_>> {
        restore_permit(&self.items, self.mutex.lock())
    }

    fn copy_out(&self, buffer: &mut [u8]) -> Result<()> {
        let _guard = self.lock_claimed()?;
        let slot = unsafe { self.control() }.release_tail();
        unsafe {
            ptr::copy_nonoverlapping(self.slot_ptr(slot), buffer.as_mut_ptr(), self.element_size);
        }
        Ok(())
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("max_elements", &self.max_elements())
            .field("element_size", &self.element_size())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Post `items` back when the step after taking one of its permits failed
fn restore_permit<T>(items: &Semaphore, result: Result<T>) -> Result<T> {
    result.map_err(|e| {
        if let Err(restore) = items.post() {
            warn!("failed to restore item permit: {}", restore);
        }
        e
    })
}

/// Unlink a semaphore left behind by a crashed run
fn clear_stale(name: &str) {
    match Semaphore::unlink(name) {
        Ok(true) => debug!("removed stale semaphore {}", name),
        Ok(false) => {}
        Err(e) => warn!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        format!(
            "/sq{}_{}_{}",
            std::process::id() % 100_000,
            SEQ.fetch_add(1, Ordering::Relaxed),
            ts
        )
    }

    /// Destroys the queue when the test ends, even on panic
    struct Cleanup(String);

    impl Drop for Cleanup {
        fn drop(&mut self) {
            let _ = Queue::destroy(&self.0);
        }
    }

    #[test]
    fn test_drop_oldest_scenario() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let q = Queue::create(&name, 2, 4).unwrap();

        assert!(q.push(&[1, 1, 1, 1]).unwrap());
        assert!(q.push(&[2, 2, 2, 2]).unwrap());
        assert!(!q.push(&[3, 3, 3, 3]).unwrap());
        assert_eq!(q.len().unwrap(), 2);

        let mut buf = [0u8; 4];
        assert!(q.try_pop(&mut buf).unwrap());
        assert_eq!(buf, [2, 2, 2, 2]);
        assert!(q.try_pop(&mut buf).unwrap());
        assert_eq!(buf, [3, 3, 3, 3]);
        assert!(!q.try_pop(&mut buf).unwrap());

        Queue::destroy(&name).unwrap();
    }

    #[test]
    fn test_fifo_within_capacity() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let q = Queue::create(&name, 8, 16).unwrap();

        // wrap the ring a few times
        for round in 0..3u8 {
            for i in 0..8u8 {
                let record = [round.wrapping_mul(31).wrapping_add(i); 16];
                assert!(q.push(&record).unwrap());
            }
            for i in 0..8u8 {
                let mut buf = [0u8; 16];
                q.pop(&mut buf).unwrap();
                assert_eq!(buf, [round.wrapping_mul(31).wrapping_add(i); 16]);
            }
        }
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let q = Queue::create(&name, 4, 1).unwrap();

        for i in 0..4u8 {
            assert!(q.push(&[i]).unwrap());
        }
        for i in 4..10u8 {
            assert!(!q.push(&[i]).unwrap());
            assert_eq!(q.len().unwrap(), 4);
        }

        let mut buf = [0u8; 1];
        for expected in 6..10u8 {
            assert!(q.try_pop(&mut buf).unwrap());
            assert_eq!(buf[0], expected);
        }
        // item permits did not outgrow the occupied slots
        assert!(!q.try_pop(&mut buf).unwrap());
        assert!(q.borrow().unwrap().is_none());
    }

    #[test]
    fn test_eviction_during_pending_pop_keeps_permits_bounded() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let q = Queue::create(&name, 1, 1).unwrap();
        q.push(&[1]).unwrap();

        // a reader holds its item permit and has not taken the mutex yet
        let attached = q.attached().unwrap();
        assert!(attached.items.try_wait().unwrap());
        assert!(!q.push(&[2]).unwrap());

        let mut buf = [0u8; 1];
        attached.copy_out(&mut buf).unwrap();
        assert_eq!(buf, [2]);

        assert!(!q.try_pop(&mut buf).unwrap());
        assert!(q.borrow().unwrap().is_none());
        assert_eq!(q.indices(), (0, 0, 0));
    }

    #[test]
    fn test_failed_lock_restores_item_permit() {
        let sem_name = format!("/sqr{}", std::process::id() % 100_000);
        let _ = Semaphore::unlink(&sem_name);
        let items = Semaphore::create(&sem_name, 0).unwrap();

        let failed: Result<()> = restore_permit(&items, Err(Error::NotInitialized));
        assert!(matches!(failed, Err(Error::NotInitialized)));
        assert!(items.try_wait().unwrap());
        assert!(!items.try_wait().unwrap());

        // success passes through without posting
        assert_eq!(restore_permit(&items, Ok(3)).unwrap(), 3);
        assert!(!items.try_wait().unwrap());

        Semaphore::unlink(&sem_name).unwrap();
    }

    #[test]
    fn test_commit_pop_rejects_foreign_index() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let q = Queue::create(&name, 2, 1).unwrap();

        assert!(q.commit_pop(1).is_ok());
        assert!(matches!(q.commit_pop(2), Err(Error::Corrupted(_))));
        assert!(matches!(q.commit_pop(usize::MAX), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_destroy_unlinks_items_without_mutex() {
        let name = unique_name();
        let (mutex_name, items_name) = naming::sem_names(&name).unwrap();
        let q = Queue::create(&name, 2, 2).unwrap();

        assert!(Semaphore::unlink(&mutex_name).unwrap());
        Queue::destroy(&name).unwrap();

        assert!(Semaphore::open(&mutex_name).is_err());
        assert!(Semaphore::open(&items_name).is_err());
        drop(q);
    }

    #[test]
    fn test_empty_pop_leaves_indices_alone() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let q = Queue::create(&name, 3, 2).unwrap();
        q.push(&[1, 2]).unwrap();
        let mut buf = [0u8; 2];
        q.try_pop(&mut buf).unwrap();

        let before = q.indices();
        assert!(!q.try_pop(&mut buf).unwrap());
        assert!(q.borrow().unwrap().is_none());
        assert_eq!(q.indices(), before);
        assert_eq!(before, (1, 1, 0));
    }

    #[test]
    fn test_borrow_reads_slot_in_place() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let q = Queue::create(&name, 2, 3).unwrap();
        q.push(b"abc").unwrap();
        q.push(b"def").unwrap();

        {
            let slot = q.borrow().unwrap().unwrap();
            assert_eq!(slot.index(), 0);
            assert_eq!(&*slot, b"abc");
            // accounting already advanced
            assert_eq!(q.len().unwrap(), 1);
        }

        let slot = q.borrow().unwrap().unwrap();
        assert_eq!(slot.index(), 1);
        assert_eq!(slot.as_slice(), b"def");
        slot.commit();
        assert_eq!(q.indices(), (0, 0, 0));
    }

    #[test]
    fn test_blocking_pop_waits_for_push() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let q = Queue::create(&name, 4, 8).unwrap();

        thread::scope(|s| {
            let reader = s.spawn(|| {
                let q = Queue::open(&name).unwrap();
                let mut buf = [0u8; 8];
                q.pop(&mut buf).unwrap();
                buf
            });
            thread::sleep(Duration::from_millis(50));
            q.push(&7u64.to_le_bytes()).unwrap();
            assert_eq!(reader.join().unwrap(), 7u64.to_le_bytes());
        });
    }

    #[test]
    fn test_concurrent_handles_share_ring() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let q = Queue::create(&name, 64, 8).unwrap();
        const PER_WRITER: u64 = 500;

        let received = thread::scope(|s| {
            for w in 0..2u64 {
                let name = &name;
                s.spawn(move || {
                    let q = Queue::open(name).unwrap();
                    for i in 0..PER_WRITER {
                        // a slow reader may cost us records, never corrupt them
                        q.push(&(w * PER_WRITER + i).to_le_bytes()).unwrap();
                    }
                });
            }
            let reader = s.spawn(|| {
                let mut seen = Vec::new();
                let mut buf = [0u8; 8];
                let mut idle = 0;
                while idle < 200 {
                    if q.try_pop(&mut buf).unwrap() {
                        seen.push(u64::from_le_bytes(buf));
                        idle = 0;
                    } else {
                        idle += 1;
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                seen
            });
            reader.join().unwrap()
        });

        assert!(!received.is_empty());
        for w in 0..2u64 {
            let mine: Vec<u64> = received
                .iter()
                .copied()
                .filter(|v| v / PER_WRITER == w)
                .collect();
            assert!(mine.windows(2).all(|p| p[0] < p[1]));
        }
        assert!(received.iter().all(|&v| v < 2 * PER_WRITER));
    }

    #[test]
    fn test_open_recovers_geometry() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let created = Queue::create(&name, 5, 24).unwrap();
        created.push(&[9u8; 24]).unwrap();

        let opened = Queue::open(&name).unwrap();
        assert_eq!(opened.max_elements(), 5);
        assert_eq!(opened.element_size(), 24);
        assert_eq!(opened.name(), name);
        let mut buf = [0u8; 24];
        assert!(opened.try_pop(&mut buf).unwrap());
        assert_eq!(buf, [9u8; 24]);
    }

    #[test]
    fn test_lifecycle_errors() {
        let name = unique_name();
        assert!(matches!(Queue::open(&name), Err(Error::NotFound(_))));
        assert!(matches!(
            Queue::create("/has space", 2, 4),
            Err(Error::InvalidName { .. })
        ));
        assert!(matches!(
            Queue::create(&name, 0, 4),
            Err(Error::InvalidCapacity)
        ));
        assert!(matches!(
            Queue::create(&name, usize::MAX, 2),
            Err(Error::CapacityOverflow { .. })
        ));
        // none of the failures above left anything behind
        assert!(matches!(Queue::open(&name), Err(Error::NotFound(_))));

        let _cleanup = Cleanup(name.clone());
        let _q = Queue::create(&name, 1, 1).unwrap();
        assert!(matches!(
            Queue::create(&name, 1, 1),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let name = unique_name();
        let q = Queue::create(&name, 2, 2).unwrap();
        Queue::destroy(&name).unwrap();
        Queue::destroy(&name).unwrap();

        // the existing mapping survives destruction
        assert!(q.push(&[1, 2]).unwrap());
        let mut buf = [0u8; 2];
        assert!(q.try_pop(&mut buf).unwrap());
        assert!(matches!(Queue::open(&name), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_closed_handle_fails_fast() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let mut q = Queue::create(&name, 2, 2).unwrap();
        q.close();
        q.close();

        assert!(!q.is_open());
        assert_eq!(q.max_elements(), 0);
        assert_eq!(q.element_size(), 0);
        assert!(matches!(q.push(&[0u8, 0]), Err(Error::NotInitialized)));
        assert!(matches!(q.try_pop(&mut [0u8; 2]), Err(Error::NotInitialized)));
        assert!(matches!(q.borrow(), Err(Error::NotInitialized)));
        assert!(matches!(q.commit_pop(0), Err(Error::NotInitialized)));

        // closing did not remove the queue
        assert!(Queue::open(&name).is_ok());
    }

    #[test]
    fn test_short_buffers_rejected() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let q = Queue::create(&name, 2, 4).unwrap();

        assert!(matches!(
            q.push(&[1, 2, 3]),
            Err(Error::RecordSize {
                expected: 4,
                actual: 3
            })
        ));
        // longer records contribute their first element_size bytes
        assert!(q.push(&[1, 2, 3, 4, 5, 6]).unwrap());
        assert!(matches!(
            q.try_pop(&mut [0u8; 2]),
            Err(Error::RecordSize { .. })
        ));
        assert_eq!(q.len().unwrap(), 1);

        let mut buf = [0u8; 6];
        assert!(q.try_pop(&mut buf).unwrap());
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    }
}
