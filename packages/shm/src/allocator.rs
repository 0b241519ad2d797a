//! Bump heap for variable-length payloads that do not fit an RPC slot.
//!
//! Layout in words: `[0]` lock, `[1]` live writers, `[2]` high-water mark in
//! bytes; payloads start after the header at 8-byte aligned offsets.
//!
//! Space is never reclaimed per allocation. [`Allocator::free`] only drops the
//! live-writer count, and the first write after the count reaches zero rewinds
//! the high-water mark to the start of the data area. Writers that find the
//! region full sleep on the live-writer word until it drops to zero.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Result, ShmError};
use crate::locker::Locker;
use crate::segment::{remaining, SharedSegment};

/// Size of the allocator header in bytes.
pub const ALLOCATOR_HEADER_BYTES: usize = 12;

const LOCK_WORD: usize = 0;
const LIVE_WORD: usize = 1;
const MARK_WORD: usize = 2;
const ALIGN: usize = 8;

fn align_up(offset: usize) -> usize {
    (offset + ALIGN - 1) & !(ALIGN - 1)
}

/// Handle to an allocator region. Clones share the same region.
#[derive(Debug, Clone)]
pub struct Allocator {
    segment: Arc<SharedSegment>,
    locker: Locker,
}

impl Allocator {
    /// Create a region able to hold `capacity` payload bytes.
    pub fn new(capacity: usize) -> Self {
        let data_start = align_up(ALLOCATOR_HEADER_BYTES);
        let segment = SharedSegment::with_bytes(data_start + capacity);
        segment.store(MARK_WORD, ALLOCATOR_HEADER_BYTES as u32);
        Self::from_segment(segment)
    }

    /// Wrap an existing allocator region, typically one received from
    /// another worker.
    pub fn from_segment(segment: Arc<SharedSegment>) -> Self {
        let locker = Locker::new(segment.clone(), LOCK_WORD);
        Self { segment, locker }
    }

    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }

    /// Payload bytes available when no writer is live.
    pub fn capacity(&self) -> usize {
        self.segment
            .len_bytes()
            .saturating_sub(align_up(ALLOCATOR_HEADER_BYTES))
    }

    /// Number of writes not yet freed.
    pub fn live(&self) -> u32 {
        self.segment.load(LIVE_WORD)
    }

    /// Copy `data` into the region and return its `(ptr, len)`.
    pub fn write(&self, data: &[u8]) -> Result<(u32, u32)> {
        let _guard = self.locker.lock()?;
        self.write_locked(data)
    }

    /// Async form of [`Allocator::write`].
    pub async fn write_async(&self, data: &[u8]) -> Result<(u32, u32)> {
        let _guard = self.locker.lock_async().await?;
        self.write_locked(data)
    }

    /// Like [`Allocator::write`], but a full region is waited out: the call
    /// sleeps until every live write is freed and retries, failing with
    /// [`ShmError::Timeout`] once `timeout` has passed.
    ///
    /// Callers must not hold a live write of their own while waiting.
    pub fn write_timeout(&self, data: &[u8], timeout: Option<Duration>) -> Result<(u32, u32)> {
        if data.len() > self.capacity() {
            return Err(ShmError::CapacityExceeded {
                requested: data.len(),
                available: self.capacity(),
            });
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.write(data) {
                Err(ShmError::CapacityExceeded { .. }) => {
                    let live = self.live();
                    if live != 0 {
                        trace!(live, len = data.len(), "allocator full");
                        self.segment.wait(LIVE_WORD, live, remaining(deadline)?);
                    }
                }
                other => return other,
            }
        }
    }

    fn write_locked(&self, data: &[u8]) -> Result<(u32, u32)> {
        let segment = &self.segment;
        if segment.fetch_add(LIVE_WORD, 1) == 0 {
            segment.store(MARK_WORD, ALLOCATOR_HEADER_BYTES as u32);
        }
        let start = align_up(segment.load(MARK_WORD) as usize);
        let size = segment.len_bytes();
        if start + data.len() > size {
            segment.fetch_sub(LIVE_WORD, 1);
            return Err(ShmError::CapacityExceeded {
                requested: data.len(),
                available: size.saturating_sub(start),
            });
        }
        segment.write_bytes(start, data)?;
        let end = start + data.len();
        segment.store(MARK_WORD, end as u32);
        trace!(ptr = start, len = data.len(), "allocated");
        Ok((start as u32, data.len() as u32))
    }

    /// Release one write. The bytes stay in place until the next bulk rewind.
    pub fn free(&self, ptr: u32, len: u32) -> Result<()> {
        let previous = self
            .segment
            .fetch_update(LIVE_WORD, |live| live.checked_sub(1))
            .map_err(|_| {
                ShmError::InvalidState(format!("free of {ptr}+{len} with no live writers"))
            })?;
        if previous == 1 {
            self.segment.notify_all(LIVE_WORD);
        }
        Ok(())
    }

    /// Copy `len` bytes at `ptr` out of the region.
    pub fn get_memory(&self, ptr: u32, len: u32) -> Result<Vec<u8>> {
        self.segment.read_bytes(ptr as usize, len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn write_then_read_back() {
        let allocator = Allocator::new(256);
        let (ptr, len) = allocator.write(b"/main.rs").unwrap();
        assert_eq!(ptr as usize % ALIGN, 0);
        assert!(ptr as usize >= ALLOCATOR_HEADER_BYTES);
        assert_eq!(allocator.get_memory(ptr, len).unwrap(), b"/main.rs");

        let (ptr2, len2) = allocator.write(&[7u8; 33]).unwrap();
        assert!(ptr2 >= ptr + len);
        assert_eq!(allocator.get_memory(ptr2, len2).unwrap(), vec![7u8; 33]);
        assert_eq!(allocator.get_memory(ptr, len).unwrap(), b"/main.rs");
        assert_eq!(allocator.live(), 2);
    }

    #[test]
    fn full_capacity_fits_exactly() {
        let allocator = Allocator::new(64);
        assert_eq!(allocator.capacity(), 64);
        let data: Vec<u8> = (0..64).collect();
        let (ptr, len) = allocator.write(&data).unwrap();
        assert_eq!(allocator.get_memory(ptr, len).unwrap(), data);
    }

    #[test]
    fn exceeding_capacity_fails() {
        let allocator = Allocator::new(64);
        let err = allocator.write(&[0u8; 65]).unwrap_err();
        assert!(matches!(err, ShmError::CapacityExceeded { requested: 65, .. }));
        assert_eq!(allocator.live(), 0);

        allocator.write(&[0u8; 40]).unwrap();
        let err = allocator.write(&[0u8; 40]).unwrap_err();
        assert!(matches!(err, ShmError::CapacityExceeded { requested: 40, .. }));
        assert_eq!(allocator.live(), 1);
    }

    #[test]
    fn mark_rewinds_after_all_frees() {
        let allocator = Allocator::new(64);
        let a = allocator.write(&[1u8; 40]).unwrap();
        allocator.free(a.0, a.1).unwrap();

        let b = allocator.write(&[2u8; 40]).unwrap();
        assert_eq!(a.0, b.0);
        allocator.free(b.0, b.1).unwrap();
        assert!(allocator.free(b.0, b.1).is_err());
    }

    #[test]
    fn live_writer_blocks_rewind() {
        let allocator = Allocator::new(128);
        let a = allocator.write(&[1u8; 8]).unwrap();
        let b = allocator.write(&[2u8; 8]).unwrap();
        allocator.free(b.0, b.1).unwrap();
        let c = allocator.write(&[3u8; 8]).unwrap();
        assert!(c.0 > b.0);
        assert_eq!(allocator.get_memory(a.0, a.1).unwrap(), vec![1u8; 8]);
    }

    #[test]
    fn concurrent_writers_never_overlap() {
        let allocator = Allocator::new(4096);
        let handles: Vec<_> = (0..4u8)
            .map(|tag| {
                let allocator = allocator.clone();
                thread::spawn(move || {
                    (0..16)
                        .map(|_| allocator.write(&[tag; 24]).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for (tag, handle) in handles.into_iter().enumerate() {
            for (ptr, len) in handle.join().unwrap() {
                assert_eq!(allocator.get_memory(ptr, len).unwrap(), vec![tag as u8; 24]);
            }
        }
        assert_eq!(allocator.live(), 64);
    }

    #[test]
    fn write_timeout_waits_for_rewind() {
        let allocator = Allocator::new(64);
        let held = allocator.write(&[1u8; 48]).unwrap();

        let freer = {
            let allocator = allocator.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                allocator.free(held.0, held.1).unwrap();
            })
        };
        let (ptr, len) = allocator
            .write_timeout(&[2u8; 48], Some(Duration::from_secs(5)))
            .unwrap();
        freer.join().unwrap();
        assert_eq!(ptr, held.0);
        assert_eq!(allocator.get_memory(ptr, len).unwrap(), vec![2u8; 48]);
        assert_eq!(allocator.live(), 1);
    }

    #[test]
    fn write_timeout_gives_up_while_region_is_held() {
        let allocator = Allocator::new(64);
        allocator.write(&[1u8; 48]).unwrap();

        let start = Instant::now();
        let err = allocator
            .write_timeout(&[2u8; 48], Some(Duration::from_millis(100)))
            .unwrap_err();
        assert_eq!(err, ShmError::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(allocator.live(), 1);
    }

    #[test]
    fn write_timeout_rejects_oversized_payload_at_once() {
        let allocator = Allocator::new(16);
        let err = allocator.write_timeout(&[0u8; 17], None).unwrap_err();
        assert!(matches!(err, ShmError::CapacityExceeded { requested: 17, .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_async_round_trip() {
        let allocator = Allocator::new(128);
        let (ptr, len) = allocator.write_async(b"hello").await.unwrap();
        assert_eq!(allocator.get_memory(ptr, len).unwrap(), b"hello");
    }
}
