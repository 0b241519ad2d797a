//! Mutual exclusion over one word of a shared segment.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Result, ShmError};
use crate::segment::{remaining, SharedSegment};

/// Values a lock word can hold.
pub mod lock_state {
    pub const UNLOCKED: u32 = 0;
    pub const LOCKED: u32 = 1;
    /// Held as the lower-ordered half of a dual lock.
    pub const DUAL_FIRST: u32 = 2;
    /// Held as the higher-ordered half of a dual lock.
    pub const DUAL_SECOND: u32 = 3;
}

/// How [`Locker::dual_lock`] acquires its pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DualLockMode {
    /// Block on the first lock, then block on the second.
    #[default]
    Ordered,
    /// Hold the first lock only while the second is free; otherwise release it,
    /// wait for the second to be released and start over. After `retries`
    /// rounds this falls back to [`DualLockMode::Ordered`].
    Backoff { retries: u32 },
}

/// A lock living in word `index` of a segment.
///
/// Lockers are plain handles; any number of workers may hold a clone of the
/// same locker.
#[derive(Debug, Clone)]
pub struct Locker {
    segment: Arc<SharedSegment>,
    index: usize,
}

impl Locker {
    pub fn new(segment: Arc<SharedSegment>, index: usize) -> Self {
        Self { segment, index }
    }

    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Current raw value of the lock word.
    pub fn state(&self) -> u32 {
        self.segment.load(self.index)
    }

    /// Block until the lock is held.
    pub fn lock(&self) -> Result<LockGuard> {
        self.lock_timeout(None)
    }

    /// Block until the lock is held or `timeout` elapses.
    pub fn lock_timeout(&self, timeout: Option<Duration>) -> Result<LockGuard> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.acquire(lock_state::LOCKED, deadline)?;
        Ok(LockGuard {
            locker: self.clone(),
        })
    }

    /// Take the lock if it is free right now.
    pub fn try_lock(&self) -> Option<LockGuard> {
        self.try_acquire(lock_state::LOCKED).then(|| LockGuard {
            locker: self.clone(),
        })
    }

    /// Suspend the calling task until the lock is held.
    pub async fn lock_async(&self) -> Result<LockGuard> {
        loop {
            match self
                .segment
                .compare_exchange(self.index, lock_state::UNLOCKED, lock_state::LOCKED)
            {
                Ok(_) => {
                    return Ok(LockGuard {
                        locker: self.clone(),
                    })
                }
                Err(held) => {
                    self.segment.wait_async(self.index, held, None).await?;
                }
            }
        }
    }

    fn try_acquire(&self, state: u32) -> bool {
        self.segment
            .compare_exchange(self.index, lock_state::UNLOCKED, state)
            .is_ok()
    }

    fn acquire(&self, state: u32, deadline: Option<Instant>) -> Result<()> {
        loop {
            match self
                .segment
                .compare_exchange(self.index, lock_state::UNLOCKED, state)
            {
                Ok(_) => return Ok(()),
                Err(held) => {
                    self.segment.wait(self.index, held, remaining(deadline)?);
                }
            }
        }
    }

    fn release(&self) {
        self.segment.store(self.index, lock_state::UNLOCKED);
        // Backoff waiters sleep on this word without competing for it, so
        // everyone has to see the release.
        self.segment.notify_all(self.index);
    }

    fn order_key(&self) -> (usize, usize) {
        (Arc::as_ptr(&self.segment) as usize, self.index)
    }

    /// Acquire two lockers without risking a reversed-order deadlock.
    ///
    /// The pair is sorted by segment address, then word index, so every
    /// caller acquires in the same order regardless of argument order.
    pub fn dual_lock(a: &Locker, b: &Locker, mode: DualLockMode) -> Result<DualLockGuard> {
        Self::dual_lock_timeout(a, b, mode, None)
    }

    pub fn dual_lock_timeout(
        a: &Locker,
        b: &Locker,
        mode: DualLockMode,
        timeout: Option<Duration>,
    ) -> Result<DualLockGuard> {
        if a.order_key() == b.order_key() {
            return Err(ShmError::InvalidState(format!(
                "dual lock on a single word (index {})",
                a.index
            )));
        }
        let (first, second) = if a.order_key() < b.order_key() {
            (a, b)
        } else {
            (b, a)
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        if let DualLockMode::Backoff { retries } = mode {
            for round in 0..retries {
                first.acquire(lock_state::DUAL_FIRST, deadline)?;
                if second.try_acquire(lock_state::DUAL_SECOND) {
                    return Ok(DualLockGuard::new(first, second));
                }
                first.release();
                trace!(round, first = first.index, second = second.index, "dual lock backing off");
                let held = second.state();
                if held != lock_state::UNLOCKED {
                    second
                        .segment
                        .wait(second.index, held, remaining(deadline)?);
                }
            }
            trace!(retries, "dual lock falling back to ordered acquisition");
        }

        first.acquire(lock_state::DUAL_FIRST, deadline)?;
        if let Err(e) = second.acquire(lock_state::DUAL_SECOND, deadline) {
            first.release();
            return Err(e);
        }
        Ok(DualLockGuard::new(first, second))
    }
}

/// Holds a [`Locker`] until dropped.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    locker: Locker,
}

impl LockGuard {
    pub fn locker(&self) -> &Locker {
        &self.locker
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locker.release();
    }
}

/// Holds both halves of a dual lock until dropped.
#[derive(Debug)]
#[must_use = "both locks are released as soon as the guard is dropped"]
pub struct DualLockGuard {
    first: Locker,
    second: Locker,
}

impl DualLockGuard {
    fn new(first: &Locker, second: &Locker) -> Self {
        Self {
            first: first.clone(),
            second: second.clone(),
        }
    }
}

impl Drop for DualLockGuard {
    fn drop(&mut self) {
        self.second.release();
        self.first.release();
    }
}
