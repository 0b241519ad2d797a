//! The background worker: creates siblings and decides when a farm is done.
//!
//! One background worker runs per farm, on its own thread with a
//! current-thread tokio runtime. Two tasks share it:
//!
//! - **serve** listens on the request pair and turns each spawn request into
//!   a sibling through the [`WorkerFactory`], answering with the new thread id.
//! - **supervise** receives [`WorkerEvent`]s. The start worker finishing, any
//!   `proc_exit`, or any failure ends the farm: every remaining worker is
//!   terminated, given [`FarmConfig::shutdown_grace`] to report, and a
//!   [`DoneReport`] is relayed over the done pair to the [`WorkerRef`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use wasi_farm_park::layout::{deposit, withdraw};
use wasi_farm_park::{Errno, WasiResult};
use wasi_farm_shm::{Allocator, AsyncCaller, Listener, Locker, SharedSegment, ShmError};

use crate::config::FarmConfig;
use crate::error::{Result, RuntimeError, SerializedError};
use crate::spawner::{words, Message, SpawnRequest, WorkerBackgroundRef, KIND_SHUTDOWN, KIND_SPAWN};
use crate::worker::{WorkerEvent, WorkerHandle};

/// Exit code reported when a worker failed.
const FAILURE_EXIT_CODE: i32 = 1;

/// Creates sibling workers for the background worker.
pub trait WorkerFactory: Send + Sync + 'static {
    /// Start a worker running `wasi_thread_start(tid, request.start_arg)`.
    fn spawn_thread(
        &self,
        tid: i32,
        request: SpawnRequest,
        background: WorkerBackgroundRef,
    ) -> Result<WorkerHandle>;
}

/// How a farm ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneReport {
    pub exit_code: i32,
    /// The first failure, if the farm ended because of one.
    pub error: Option<SerializedError>,
    /// Exit codes of siblings that finished on their own.
    pub threads: BTreeMap<i32, i32>,
    /// Workers still running when the farm ended, all sent a kill request.
    pub terminated: Vec<i32>,
}

/// Host-side end of the done pair.
#[derive(Debug)]
pub struct WorkerRef {
    segment: Arc<SharedSegment>,
    allocator: Allocator,
    done: Listener,
}

impl WorkerRef {
    /// Block until the background worker reports the end of the farm.
    pub fn wait(mut self) -> Result<DoneReport> {
        let call = self.done.listen()?;
        let ptr = self.segment.load(words::DONE_PTR);
        let len = self.segment.load(words::DONE_LEN);
        let payload = withdraw(&self.allocator, ptr, len);
        call.finish();
        Ok(serde_json::from_slice(&payload?)?)
    }

    pub async fn wait_async(self) -> Result<DoneReport> {
        tokio::task::spawn_blocking(move || self.wait())
            .await
            .map_err(|e| RuntimeError::Join(e.to_string()))?
    }
}

/// State of a running background worker.
pub struct WorkerBackground {
    factory: Arc<dyn WorkerFactory>,
    background: WorkerBackgroundRef,
    segment: Arc<SharedSegment>,
    allocator: Allocator,
    config: FarmConfig,
    workers: Mutex<BTreeMap<i32, WorkerHandle>>,
    next_tid: AtomicI32,
    closing: AtomicBool,
}

impl WorkerBackground {
    /// Start the background worker thread.
    ///
    /// Both listeners are attached before this returns, so spawn requests and
    /// the final report can never race the thread's startup.
    pub fn spawn(
        factory: Arc<dyn WorkerFactory>,
        config: &FarmConfig,
    ) -> Result<(WorkerRef, WorkerBackgroundRef)> {
        let segment = SharedSegment::new(words::TOTAL);
        let allocator = Allocator::new(config.background_allocator_capacity);
        let (events, inbox) = mpsc::unbounded_channel();
        let background = WorkerBackgroundRef {
            segment: segment.clone(),
            allocator: allocator.segment().clone(),
            events,
        };

        let requests = Listener::attach(segment.clone(), words::REQUEST_CALL)?;
        let done = Listener::attach(segment.clone(), words::DONE_CALL)?;

        let worker = Arc::new(WorkerBackground {
            factory,
            background: background.clone(),
            segment: segment.clone(),
            allocator: allocator.clone(),
            config: config.clone(),
            workers: Mutex::new(BTreeMap::new()),
            next_tid: AtomicI32::new(1),
            closing: AtomicBool::new(false),
        });
        thread::Builder::new()
            .name("farm-background".to_string())
            .spawn(move || worker.run(requests, inbox))?;

        Ok((
            WorkerRef {
                segment,
                allocator,
                done,
            },
            background,
        ))
    }

    fn run(self: Arc<Self>, requests: Listener, inbox: mpsc::UnboundedReceiver<Message>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "background runtime failed to start");
                return;
            }
        };

        let grace = self.config.shutdown_grace;
        runtime.block_on(async move {
            let serve = tokio::spawn(self.clone().serve(requests));
            let report = self.supervise(inbox).await;
            if let Err(e) = self.deliver(&report).await {
                warn!(error = %e, "final report not delivered");
            }
            if let Err(e) = self.stop_serving().await {
                warn!(error = %e, "request listener did not stop");
            }
            match serve.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "request listener failed"),
                Err(e) => warn!(error = %e, "request listener panicked"),
            }
        });
        runtime.shutdown_timeout(grace);
        debug!("background worker stopped");
    }

    async fn serve(self: Arc<Self>, mut requests: Listener) -> Result<()> {
        use words::*;

        loop {
            let call = requests.listen_async().await?;
            match self.segment.load(REQUEST_KIND) {
                KIND_SHUTDOWN => {
                    call.finish();
                    return Ok(());
                }
                KIND_SPAWN => {
                    let (tid, errno) = match self.spawn_sibling() {
                        Ok(tid) => (tid, Errno::SUCCESS),
                        Err(errno) => (-1, errno),
                    };
                    self.segment.store_i32(REPLY_TID, tid);
                    self.segment.store(REPLY_ERRNO, errno.raw() as u32);
                    call.finish();
                }
                kind => {
                    warn!(kind, "unknown background request");
                    self.segment.store(REPLY_ERRNO, Errno::INVAL.raw() as u32);
                    call.finish();
                }
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn spawn_sibling(&self) -> WasiResult<i32> {
        let ptr = self.segment.load(words::REQUEST_PTR);
        let len = self.segment.load(words::REQUEST_LEN);
        let payload = withdraw(&self.allocator, ptr, len).map_err(|e| {
            warn!(error = %e, "spawn request unreadable");
            Errno::IO
        })?;
        let request: SpawnRequest = serde_json::from_slice(&payload).map_err(|e| {
            warn!(error = %e, "spawn request malformed");
            Errno::INVAL
        })?;

        if self.closing.load(Ordering::SeqCst) {
            debug!("farm is ending, refusing spawn");
            return Err(Errno::AGAIN);
        }
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        if tid <= 0 || tid as u32 > self.config.max_threads {
            warn!(tid, max = self.config.max_threads, "thread ids exhausted");
            return Err(Errno::AGAIN);
        }

        let handle = self
            .factory
            .spawn_thread(tid, request, self.background.clone())
            .map_err(|e| {
                warn!(tid, error = %e, "sibling could not be created");
                Errno::AGAIN
            })?;
        self.workers.lock().insert(tid, handle);
        info!(tid, "sibling spawned");
        Ok(tid)
    }

    async fn supervise(&self, mut inbox: mpsc::UnboundedReceiver<Message>) -> DoneReport {
        let mut report = DoneReport::default();
        // A worker can report before its handle is registered.
        let mut seen = BTreeSet::new();

        while let Some(message) = inbox.recv().await {
            let event = match message {
                Message::Adopt(handle) => {
                    if !seen.contains(&handle.tid()) {
                        self.workers.lock().insert(handle.tid(), handle);
                    }
                    continue;
                }
                Message::Event(event) => event,
            };
            seen.insert(event.tid());
            self.workers.lock().remove(&event.tid());
            match event {
                WorkerEvent::Exited { tid: 0, code } => {
                    report.exit_code = code;
                    break;
                }
                WorkerEvent::Exited { tid, code } => {
                    report.threads.insert(tid, code);
                }
                WorkerEvent::ProcExit { tid, code } => {
                    if tid != 0 {
                        report.threads.insert(tid, code);
                    }
                    report.exit_code = code;
                    break;
                }
                WorkerEvent::Failed { tid, error } => {
                    warn!(tid, %error, "worker failed, ending farm");
                    report.exit_code = FAILURE_EXIT_CODE;
                    report.error = Some(error);
                    break;
                }
            }
        }

        self.closing.store(true, Ordering::SeqCst);
        let mut pending: BTreeSet<i32> = {
            let mut workers = self.workers.lock();
            workers.retain(|tid, _| !seen.contains(tid));
            for handle in workers.values() {
                handle.terminate();
            }
            workers.keys().copied().collect()
        };
        report.terminated = pending.iter().copied().collect();
        if !pending.is_empty() {
            debug!(?pending, "terminating remaining workers");
        }
        // The start worker's handle may still be on its way.
        if !seen.contains(&0) {
            pending.insert(0);
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while !pending.is_empty() {
            match tokio::time::timeout_at(deadline, inbox.recv()).await {
                Ok(Some(Message::Event(event))) => {
                    let tid = event.tid();
                    seen.insert(tid);
                    pending.remove(&tid);
                    self.workers.lock().remove(&tid);
                    if let WorkerEvent::Exited { tid, code } = event {
                        report.threads.insert(tid, code);
                    }
                }
                Ok(Some(Message::Adopt(handle))) => {
                    if !seen.contains(&handle.tid()) {
                        handle.terminate();
                        report.terminated.push(handle.tid());
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(?pending, "workers still running after grace period");
                    break;
                }
            }
        }
        report.terminated.sort_unstable();
        info!(exit_code = report.exit_code, failed = report.error.is_some(), "farm done");
        report
    }

    async fn deliver(&self, report: &DoneReport) -> Result<()> {
        let payload = serde_json::to_vec(report)?;
        let (ptr, len) = deposit(&self.allocator, &payload, self.config.call_timeout)?;
        self.segment.store(words::DONE_PTR, ptr);
        self.segment.store(words::DONE_LEN, len);
        let call = AsyncCaller::new(self.segment.clone(), words::DONE_CALL)
            .with_timeout(self.config.call_timeout)
            .call()
            .await;
        match call {
            Ok(()) => Ok(()),
            Err(ShmError::Abandoned) => Err(ShmError::Abandoned.into()),
            Err(e) => {
                self.allocator.free(ptr, len)?;
                Err(e.into())
            }
        }
    }

    /// Release the request listener with a call of our own.
    async fn stop_serving(&self) -> Result<()> {
        let _guard = Locker::new(self.segment.clone(), words::REQUEST_LOCK)
            .lock_async()
            .await?;
        self.segment.store(words::REQUEST_KIND, KIND_SHUTDOWN);
        AsyncCaller::new(self.segment.clone(), words::REQUEST_CALL)
            .with_timeout(self.config.call_timeout)
            .call()
            .await?;
        Ok(())
    }
}
