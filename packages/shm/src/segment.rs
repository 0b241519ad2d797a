//! Fixed-size shared region with futex-style wait/notify.
//!
//! A segment is an array of 32-bit words. The same bytes can be read as
//! bytes, `u32`/`i32` words, or `u64` word pairs (little-endian). Waiting and
//! waking are keyed by the address of a word, like a futex.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot_core::{ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

use crate::error::{Result, ShmError};

/// Outcome of a [`SharedSegment::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Another party called `notify` on the word.
    Woken,
    /// The word no longer held the expected value when the wait started.
    NotEqual,
    /// The timeout elapsed first.
    TimedOut,
}

/// A fixed-size block of shared words.
///
/// Segments are always handled through `Arc`; cloning the `Arc` is how a
/// segment crosses a worker boundary.
pub struct SharedSegment {
    words: Box<[AtomicU32]>,
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("words", &self.words.len())
            .finish()
    }
}

impl SharedSegment {
    /// Create a zeroed segment of `len_words` words.
    pub fn new(len_words: usize) -> Arc<Self> {
        let words = (0..len_words).map(|_| AtomicU32::new(0)).collect();
        Arc::new(Self { words })
    }

    /// Create a zeroed segment holding at least `len_bytes` bytes.
    pub fn with_bytes(len_bytes: usize) -> Arc<Self> {
        Self::new(len_bytes.div_ceil(4))
    }

    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }

    pub fn load(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::SeqCst)
    }

    pub fn store(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::SeqCst);
    }

    pub fn load_i32(&self, index: usize) -> i32 {
        self.load(index) as i32
    }

    pub fn store_i32(&self, index: usize, value: i32) {
        self.store(index, value as u32);
    }

    /// Read a `u64` spread over words `index` (low) and `index + 1` (high).
    ///
    /// The pair is not read atomically; callers hold the lock guarding it.
    pub fn load_u64(&self, index: usize) -> u64 {
        let low = self.load(index) as u64;
        let high = self.load(index + 1) as u64;
        (high << 32) | low
    }

    pub fn store_u64(&self, index: usize, value: u64) {
        self.store(index, value as u32);
        self.store(index + 1, (value >> 32) as u32);
    }

    pub fn load_i64(&self, index: usize) -> i64 {
        self.load_u64(index) as i64
    }

    pub fn store_i64(&self, index: usize, value: i64) {
        self.store_u64(index, value as u64);
    }

    pub fn compare_exchange(
        &self,
        index: usize,
        current: u32,
        new: u32,
    ) -> std::result::Result<u32, u32> {
        self.words[index].compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn fetch_add(&self, index: usize, value: u32) -> u32 {
        self.words[index].fetch_add(value, Ordering::SeqCst)
    }

    pub fn fetch_sub(&self, index: usize, value: u32) -> u32 {
        self.words[index].fetch_sub(value, Ordering::SeqCst)
    }

    pub fn fetch_or(&self, index: usize, value: u32) -> u32 {
        self.words[index].fetch_or(value, Ordering::SeqCst)
    }

    pub fn fetch_and(&self, index: usize, value: u32) -> u32 {
        self.words[index].fetch_and(value, Ordering::SeqCst)
    }

    pub fn swap(&self, index: usize, value: u32) -> u32 {
        self.words[index].swap(value, Ordering::SeqCst)
    }

    /// Atomically update a word with `f`, returning the previous value.
    ///
    /// Fails with the current value if `f` returns `None`.
    pub fn fetch_update(
        &self,
        index: usize,
        f: impl FnMut(u32) -> Option<u32>,
    ) -> std::result::Result<u32, u32> {
        self.words[index].fetch_update(Ordering::SeqCst, Ordering::SeqCst, f)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let size = self.len_bytes();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(ShmError::OutOfBounds { offset, len, size }),
        }
    }

    /// Copy `len` bytes starting at byte `offset` out of the segment.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let word = self.load(pos / 4).to_le_bytes();
            let start = pos % 4;
            let take = (4 - start).min(end - pos);
            out.extend_from_slice(&word[start..start + take]);
            pos += take;
        }
        Ok(out)
    }

    /// Copy `data` into the segment at byte `offset`.
    ///
    /// Partially covered words are merged with an atomic read-modify-write so
    /// neighbouring bytes are left intact.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let mut pos = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let index = pos / 4;
            let start = pos % 4;
            let take = (4 - start).min(rest.len());
            if start == 0 && take == 4 {
                let word = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
                self.store(index, word);
            } else {
                let mut patch = [0u8; 4];
                patch[start..start + take].copy_from_slice(&rest[..take]);
                let mut mask = [0u8; 4];
                mask[start..start + take].fill(0xff);
                let patch = u32::from_le_bytes(patch);
                let mask = u32::from_le_bytes(mask);
                let _ = self.fetch_update(index, |old| Some((old & !mask) | patch));
            }
            pos += take;
            rest = &rest[take..];
        }
        Ok(())
    }

    fn key(&self, index: usize) -> usize {
        &self.words[index] as *const AtomicU32 as usize
    }

    /// Block the calling thread while word `index` equals `expected`.
    pub fn wait(&self, index: usize, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
        let word = &self.words[index];
        let deadline = timeout.map(|t| Instant::now() + t);
        // SAFETY: the validate and callback closures neither panic nor call
        // back into parking_lot_core.
        let result = unsafe {
            parking_lot_core::park(
                self.key(index),
                || word.load(Ordering::SeqCst) == expected,
                || {},
                |_, _| {},
                DEFAULT_PARK_TOKEN,
                deadline,
            )
        };
        match result {
            ParkResult::Unparked(_) => WaitOutcome::Woken,
            ParkResult::Invalid => WaitOutcome::NotEqual,
            ParkResult::TimedOut => WaitOutcome::TimedOut,
        }
    }

    /// Suspend the calling task while word `index` equals `expected`.
    ///
    /// The wait itself runs on tokio's blocking pool.
    pub async fn wait_async(
        self: &Arc<Self>,
        index: usize,
        expected: u32,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        if self.load(index) != expected {
            return Ok(WaitOutcome::NotEqual);
        }
        let segment = Arc::clone(self);
        tokio::task::spawn_blocking(move || segment.wait(index, expected, timeout))
            .await
            .map_err(|e| ShmError::Join(e.to_string()))
    }

    /// Wake up to `count` threads waiting on word `index`; returns how many woke.
    ///
    /// `u32::MAX` wakes everyone.
    pub fn notify(&self, index: usize, count: u32) -> u32 {
        let key = self.key(index);
        if count == u32::MAX {
            // SAFETY: key is the address of a word we own; no callbacks.
            return unsafe { parking_lot_core::unpark_all(key, DEFAULT_UNPARK_TOKEN) } as u32;
        }
        let mut woken = 0;
        while woken < count {
            // SAFETY: the callback neither panics nor calls back into parking_lot_core.
            let result = unsafe { parking_lot_core::unpark_one(key, |_| DEFAULT_UNPARK_TOKEN) };
            if result.unparked_threads == 0 {
                break;
            }
            woken += 1;
        }
        woken
    }

    pub fn notify_all(&self, index: usize) -> u32 {
        self.notify(index, u32::MAX)
    }
}

/// Remaining time until `deadline`, or a timeout error once it has passed.
pub(crate) fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                Err(ShmError::Timeout)
            } else {
                Ok(Some(deadline - now))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_views_share_bytes() {
        let segment = SharedSegment::new(4);
        segment.store_u64(0, 0x1122_3344_5566_7788);
        assert_eq!(segment.load(0), 0x5566_7788);
        assert_eq!(segment.load(1), 0x1122_3344);
        assert_eq!(
            segment.read_bytes(0, 8).unwrap(),
            vec![0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );

        segment.store_i32(2, -1);
        assert_eq!(segment.load(2), u32::MAX);
        segment.store_i64(2, -2);
        assert_eq!(segment.load_i64(2), -2);
    }

    #[test]
    fn unaligned_write_keeps_neighbours() {
        let segment = SharedSegment::new(3);
        segment.store(0, 0xaaaa_aaaa);
        segment.store(1, 0xbbbb_bbbb);
        segment.write_bytes(3, &[1, 2, 3]).unwrap();
        assert_eq!(segment.read_bytes(0, 8).unwrap(), vec![0xaa, 0xaa, 0xaa, 1, 2, 3, 0xbb, 0xbb]);
    }

    #[test]
    fn out_of_bounds_range() {
        let segment = SharedSegment::with_bytes(6);
        assert_eq!(segment.len_bytes(), 8);
        assert!(matches!(
            segment.read_bytes(6, 3),
            Err(ShmError::OutOfBounds { .. })
        ));
        assert!(segment.write_bytes(usize::MAX, &[1]).is_err());
    }

    #[test]
    fn wait_not_equal_returns_immediately() {
        let segment = SharedSegment::new(1);
        segment.store(0, 7);
        assert_eq!(segment.wait(0, 3, None), WaitOutcome::NotEqual);
    }

    #[test]
    fn wait_times_out() {
        let segment = SharedSegment::new(1);
        let outcome = segment.wait(0, 0, Some(Duration::from_millis(10)));
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn notify_wakes_waiter() {
        let segment = SharedSegment::new(1);
        let waiter = {
            let segment = segment.clone();
            std::thread::spawn(move || {
                while segment.load(0) == 0 {
                    segment.wait(0, 0, None);
                }
                segment.load(0)
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        segment.store(0, 1);
        segment.notify_all(0);
        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn notify_without_waiters_wakes_nobody() {
        let segment = SharedSegment::new(1);
        assert_eq!(segment.notify(0, 1), 0);
        assert_eq!(segment.notify_all(0), 0);
    }

    #[tokio::test]
    async fn wait_async_sees_store() {
        let segment = SharedSegment::new(1);
        let setter = {
            let segment = segment.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                segment.store(0, 5);
                segment.notify_all(0);
            })
        };
        loop {
            if segment.load(0) == 5 {
                break;
            }
            segment
                .wait_async(0, 0, Some(Duration::from_millis(100)))
                .await
                .unwrap();
        }
        setter.join().unwrap();
    }
}
