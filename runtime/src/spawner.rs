//! The guest-facing half of thread spawning.
//!
//! A worker blocked inside `thread-spawn` cannot create a worker itself
//! without re-entering the worker-creation API. Instead its [`ThreadSpawner`]
//! deposits a request in the background segment and calls the background
//! worker's always-listening request [`Listener`](wasi_farm_shm::Listener),
//! which creates the sibling and answers with its thread id.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, instrument};
use wasi_farm_park::layout::deposit;
use wasi_farm_park::{Errno, WasiResult};
use wasi_farm_shm::{Allocator, Caller, Locker, SharedSegment, ShmError};

use crate::config::FarmConfig;
use crate::error::{Result, RuntimeError};
use crate::fds::FdEntry;
use crate::worker::{WorkerEvent, WorkerHandle};

/// Word layout of the background segment.
pub(crate) mod words {
    /// Serializes spawn requests from all workers.
    pub const REQUEST_LOCK: usize = 0;
    /// Call state and presence of the request pair.
    pub const REQUEST_CALL: usize = 1;
    pub const REQUEST_KIND: usize = 3;
    pub const REQUEST_PTR: usize = 4;
    pub const REQUEST_LEN: usize = 5;
    pub const REPLY_TID: usize = 6;
    pub const REPLY_ERRNO: usize = 7;
    /// Call state and presence of the done pair.
    pub const DONE_CALL: usize = 8;
    pub const DONE_PTR: usize = 10;
    pub const DONE_LEN: usize = 11;
    pub const TOTAL: usize = 12;
}

pub(crate) const KIND_SPAWN: u32 = 1;
pub(crate) const KIND_SHUTDOWN: u32 = 2;

/// Payload of one spawn request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub start_arg: i32,
    /// The spawner's fd map when `thread-spawn` was called.
    pub fds: Vec<Option<FdEntry>>,
}

pub(crate) enum Message {
    Event(WorkerEvent),
    Adopt(WorkerHandle),
}

/// The plain handle workers use to reach the background worker.
///
/// Segments plus the event channel; cheap to clone into every worker.
#[derive(Debug, Clone)]
pub struct WorkerBackgroundRef {
    pub(crate) segment: Arc<SharedSegment>,
    pub(crate) allocator: Arc<SharedSegment>,
    pub(crate) events: mpsc::UnboundedSender<Message>,
}

impl WorkerBackgroundRef {
    /// Tell the background worker that a worker stopped.
    pub fn report(&self, event: WorkerEvent) {
        if self.events.send(Message::Event(event)).is_err() {
            debug!("background worker gone, event dropped");
        }
    }

    /// Hand a worker started elsewhere to the background worker, so it is
    /// terminated with the rest.
    pub fn adopt(&self, handle: WorkerHandle) {
        if let Err(mpsc::error::SendError(Message::Adopt(handle))) =
            self.events.send(Message::Adopt(handle))
        {
            debug!(tid = handle.tid(), "background worker gone, terminating orphan");
            handle.terminate();
        }
    }
}

/// Requests new siblings on behalf of one worker.
#[derive(Debug, Clone)]
pub struct ThreadSpawner {
    background: WorkerBackgroundRef,
    allocator: Allocator,
    timeout: Option<Duration>,
}

impl ThreadSpawner {
    pub fn new(background: WorkerBackgroundRef, config: &FarmConfig) -> Self {
        let allocator = Allocator::from_segment(background.allocator.clone());
        Self {
            background,
            allocator,
            timeout: config.call_timeout,
        }
    }

    /// Ask for a sibling running `wasi_thread_start(tid, start_arg)` with a
    /// copy of `fds`. Blocks until the background worker answers.
    #[instrument(skip(self, fds), level = "debug")]
    pub fn spawn(&self, start_arg: i32, fds: Vec<Option<FdEntry>>) -> Result<WasiResult<i32>> {
        use words::*;

        let payload = serde_json::to_vec(&SpawnRequest { start_arg, fds })?;
        let segment = &self.background.segment;
        let _guard = Locker::new(segment.clone(), REQUEST_LOCK).lock_timeout(self.timeout)?;

        let (ptr, len) = deposit(&self.allocator, &payload, self.timeout)?;
        segment.store(REQUEST_KIND, KIND_SPAWN);
        segment.store(REQUEST_PTR, ptr);
        segment.store(REQUEST_LEN, len);
        if let Err(e) = Caller::new(segment.clone(), REQUEST_CALL)
            .with_timeout(self.timeout)
            .call_and_wait()
        {
            // An abandoned request was already picked up and is the background's to free.
            if e != ShmError::Abandoned {
                self.allocator.free(ptr, len)?;
            }
            return Err(match e {
                ShmError::NoListener => RuntimeError::BackgroundGone,
                e => e.into(),
            });
        }

        match segment.load(REPLY_ERRNO) {
            0 => Ok(Ok(segment.load_i32(REPLY_TID))),
            raw => Ok(Err(Errno(raw as u16))),
        }
    }
}
