//! Rendezvous calls over a shared word pair.
//!
//! A call site is two consecutive words: the call state at `base` and the
//! listener presence flag at `base + 1`. The state word walks the cycle
//!
//! ```text
//! UNLOCKED -> LISTENER_LOCKED -> CALLER_WORKING -> CALL_READY
//!          -> LISTENER_WORKING -> CALL_FINISHED -> UNLOCKED
//! ```
//!
//! Exactly one listener may be attached. The caller claims a parked listener,
//! publishes the call, waits for the listener to finish and drains the pair
//! back to `UNLOCKED` before returning, so at most one call is ever
//! outstanding.
//!
//! A caller whose deadline passes after publishing retracts a call still in
//! `CALL_READY`, or moves a call the listener is working on to
//! `CALL_ABANDONED`. The listener then resets the pair itself when it
//! finishes, and owns whatever results it staged.
//!
//! Arguments and results are not part of this protocol; they live in words
//! owned by whoever serializes callers on the pair.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Result, ShmError};
use crate::segment::{remaining, SharedSegment};

/// Values the call state word can hold.
pub mod call_state {
    pub const UNLOCKED: u32 = 0;
    pub const LISTENER_LOCKED: u32 = 1;
    pub const CALLER_WORKING: u32 = 2;
    pub const CALL_READY: u32 = 3;
    pub const LISTENER_WORKING: u32 = 4;
    pub const CALL_FINISHED: u32 = 5;
    pub const CALL_ABANDONED: u32 = 6;
}

/// Words used by one call site.
pub const CALL_WORDS: usize = 2;

const PRESENT: u32 = 1;
const ABSENT: u32 = 0;

enum Step {
    Done,
    Retry,
    Wait(u32),
}

fn presence(segment: &SharedSegment, base: usize) -> u32 {
    segment.load(base + 1)
}

fn listen_step(segment: &SharedSegment, base: usize) -> Result<Step> {
    use call_state::*;
    let state = segment.load(base);
    match state {
        UNLOCKED => {
            if segment
                .compare_exchange(base, UNLOCKED, LISTENER_LOCKED)
                .is_ok()
            {
                // Callers that found no parked listener sleep on this word.
                segment.notify_all(base);
            }
            Ok(Step::Retry)
        }
        CALL_READY => match segment.compare_exchange(base, CALL_READY, LISTENER_WORKING) {
            Ok(_) => Ok(Step::Done),
            Err(_) => Ok(Step::Retry),
        },
        // Parked and waiting for a caller, or the previous call is not drained yet.
        LISTENER_LOCKED | CALLER_WORKING | CALL_FINISHED => Ok(Step::Wait(state)),
        other => Err(ShmError::InvalidState(format!(
            "listener found call state {other} at word {base}"
        ))),
    }
}

fn claim_step(segment: &SharedSegment, base: usize) -> Result<Step> {
    use call_state::*;
    match segment.load(base) {
        LISTENER_LOCKED => {
            match segment.compare_exchange(base, LISTENER_LOCKED, CALLER_WORKING) {
                Ok(_) => Ok(Step::Done),
                Err(_) => Ok(Step::Retry),
            }
        }
        // The listener is between calls and will park again shortly.
        UNLOCKED if presence(segment, base) == PRESENT => Ok(Step::Wait(UNLOCKED)),
        UNLOCKED => Err(ShmError::NoListener),
        // A previous caller gave up; the listener resets the pair when done.
        CALL_ABANDONED => Ok(Step::Wait(CALL_ABANDONED)),
        other => Err(ShmError::InFlight(other)),
    }
}

fn publish(segment: &SharedSegment, base: usize) {
    segment.store(base, call_state::CALL_READY);
    segment.notify_all(base);
}

fn finish_step(segment: &SharedSegment, base: usize) -> Result<Step> {
    use call_state::*;
    match segment.load(base) {
        CALL_FINISHED => Ok(Step::Done),
        CALL_READY if presence(segment, base) == ABSENT => {
            // The listener went away before picking the call up.
            let _ = segment.compare_exchange(base, CALL_READY, UNLOCKED);
            segment.notify_all(base);
            Err(ShmError::NoListener)
        }
        state @ (CALL_READY | LISTENER_WORKING) => Ok(Step::Wait(state)),
        other => Err(ShmError::InvalidState(format!(
            "caller found call state {other} at word {base}"
        ))),
    }
}

/// Withdraw from a published call once the deadline has passed.
///
/// A call nobody picked up is retracted and fails with [`ShmError::Timeout`].
/// A call already being worked on is left to the listener and fails with
/// [`ShmError::Abandoned`]. A call that finished meanwhile completes normally.
fn give_up(segment: &SharedSegment, base: usize) -> Result<()> {
    use call_state::*;
    loop {
        match segment.load(base) {
            CALL_READY => {
                if segment.compare_exchange(base, CALL_READY, UNLOCKED).is_ok() {
                    segment.notify_all(base);
                    return Err(ShmError::Timeout);
                }
            }
            LISTENER_WORKING => {
                if segment
                    .compare_exchange(base, LISTENER_WORKING, CALL_ABANDONED)
                    .is_ok()
                {
                    trace!(base, "call abandoned");
                    return Err(ShmError::Abandoned);
                }
            }
            CALL_FINISHED => return drain(segment, base),
            other => {
                return Err(ShmError::InvalidState(format!(
                    "caller gave up at call state {other} at word {base}"
                )))
            }
        }
    }
}

fn drain(segment: &SharedSegment, base: usize) -> Result<()> {
    segment
        .compare_exchange(base, call_state::CALL_FINISHED, call_state::UNLOCKED)
        .map_err(|state| {
            ShmError::InvalidState(format!("drain found call state {state} at word {base}"))
        })?;
    segment.notify_all(base);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenMode {
    Blocking,
    Async,
}

/// The single receiving side of a call site.
///
/// Dropping the listener detaches it; callers then fail with
/// [`ShmError::NoListener`] instead of blocking.
#[derive(Debug)]
pub struct Listener {
    segment: Arc<SharedSegment>,
    base: usize,
    mode: Option<ListenMode>,
}

impl Listener {
    /// Attach to the call site at `base`.
    pub fn attach(segment: Arc<SharedSegment>, base: usize) -> Result<Self> {
        segment
            .compare_exchange(base + 1, ABSENT, PRESENT)
            .map_err(|_| ShmError::ListenerAlreadyAttached)?;
        Ok(Self {
            segment,
            base,
            mode: None,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Forget whether this listener has been used blocking or async.
    pub fn reset(&mut self) {
        self.mode = None;
    }

    fn enter(&mut self, mode: ListenMode) -> Result<()> {
        match self.mode {
            None => {
                self.mode = Some(mode);
                Ok(())
            }
            Some(current) if current == mode => Ok(()),
            Some(_) => Err(ShmError::ModeMismatch),
        }
    }

    fn invocation(&self) -> Invocation {
        Invocation {
            segment: Arc::clone(&self.segment),
            base: self.base,
            finished: false,
        }
    }

    /// Park until a caller publishes a call, blocking the thread.
    pub fn listen(&mut self) -> Result<Invocation> {
        self.enter(ListenMode::Blocking)?;
        loop {
            match listen_step(&self.segment, self.base)? {
                Step::Done => return Ok(self.invocation()),
                Step::Retry => {}
                Step::Wait(state) => {
                    self.segment.wait(self.base, state, None);
                }
            }
        }
    }

    /// Park until a caller publishes a call, suspending only this task.
    pub async fn listen_async(&mut self) -> Result<Invocation> {
        self.enter(ListenMode::Async)?;
        loop {
            match listen_step(&self.segment, self.base)? {
                Step::Done => return Ok(self.invocation()),
                Step::Retry => {}
                Step::Wait(state) => {
                    self.segment.wait_async(self.base, state, None).await?;
                }
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.segment.compare_exchange(
            self.base,
            call_state::LISTENER_LOCKED,
            call_state::UNLOCKED,
        );
        self.segment.store(self.base + 1, ABSENT);
        self.segment.notify_all(self.base);
    }
}

/// A call picked up by a [`Listener`].
///
/// The caller stays blocked until the invocation is finished or dropped.
#[derive(Debug)]
pub struct Invocation {
    segment: Arc<SharedSegment>,
    base: usize,
    finished: bool,
}

impl Invocation {
    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }

    /// Release the caller.
    ///
    /// Returns `false` if the caller had already given up. Results staged for
    /// it are then the listener's to clean up.
    pub fn finish(mut self) -> bool {
        self.complete()
    }

    fn complete(&mut self) -> bool {
        if self.finished {
            return true;
        }
        self.finished = true;
        let delivered = self
            .segment
            .compare_exchange(self.base, call_state::LISTENER_WORKING, call_state::CALL_FINISHED)
            .is_ok();
        if !delivered {
            self.segment.store(self.base, call_state::UNLOCKED);
        }
        self.segment.notify_all(self.base);
        delivered
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        let _ = self.complete();
    }
}

/// The calling side of a call site; blocks the calling thread.
#[derive(Debug, Clone)]
pub struct Caller {
    segment: Arc<SharedSegment>,
    base: usize,
    timeout: Option<Duration>,
}

impl Caller {
    pub fn new(segment: Arc<SharedSegment>, base: usize) -> Self {
        Self {
            segment,
            base,
            timeout: None,
        }
    }

    /// Give up with [`ShmError::Timeout`] once a call takes longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }

    /// Run one full call and return once the listener has finished it.
    pub fn call_and_wait(&self) -> Result<()> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let segment = &*self.segment;

        loop {
            match claim_step(segment, self.base)? {
                Step::Done => break,
                Step::Retry => {}
                Step::Wait(state) => {
                    segment.wait(self.base, state, remaining(deadline)?);
                }
            }
        }
        publish(segment, self.base);
        trace!(base = self.base, "call published");

        loop {
            match finish_step(segment, self.base)? {
                Step::Done => break,
                Step::Retry => {}
                Step::Wait(state) => match remaining(deadline) {
                    Ok(timeout) => {
                        segment.wait(self.base, state, timeout);
                    }
                    Err(_) => return give_up(segment, self.base),
                },
            }
        }
        drain(segment, self.base)
    }
}

/// The calling side of a call site for code running on an event loop.
#[derive(Debug, Clone)]
pub struct AsyncCaller {
    segment: Arc<SharedSegment>,
    base: usize,
    timeout: Option<Duration>,
}

impl AsyncCaller {
    pub fn new(segment: Arc<SharedSegment>, base: usize) -> Self {
        Self {
            segment,
            base,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one full call, suspending the task instead of the thread.
    pub async fn call(&self) -> Result<()> {
        let deadline = self.timeout.map(|t| Instant::now() + t);

        loop {
            match claim_step(&self.segment, self.base)? {
                Step::Done => break,
                Step::Retry => {}
                Step::Wait(state) => {
                    self.segment
                        .wait_async(self.base, state, remaining(deadline)?)
                        .await?;
                }
            }
        }
        publish(&self.segment, self.base);

        loop {
            match finish_step(&self.segment, self.base)? {
                Step::Done => break,
                Step::Retry => {}
                Step::Wait(state) => match remaining(deadline) {
                    Ok(timeout) => {
                        self.segment.wait_async(self.base, state, timeout).await?;
                    }
                    Err(_) => return give_up(&self.segment, self.base),
                },
            }
        }
        drain(&self.segment, self.base)
    }
}
