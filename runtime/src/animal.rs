//! The WASI surface one worker presents to its guest.
//!
//! An [`Animal`] owns a wasmtime store and instance. Its store data,
//! [`AnimalState`], answers every `wasi_snapshot_preview1` import: fd and path
//! operations go through the [`FdTable`] to the Parks, while args, environment,
//! clocks, randomness and polling are served locally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use wasi_farm_park::wasi::{clockid, eventtype, subclockflags};
use wasi_farm_park::{Errno, RefObject, WasiResult};
use wasmtime::{Engine, Instance, Linker, Module, SharedMemory, Store, UpdateDeadline};

use crate::config::FarmConfig;
use crate::error::{ProcExit, Result, RuntimeError, SerializedError, Terminated};
use crate::fds::{FdSeed, FdTable};
use crate::imports;
use crate::spawner::{ThreadSpawner, WorkerBackgroundRef};
use crate::worker::WorkerEvent;

/// Arguments and environment a guest sees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimalOptions {
    pub args: Vec<String>,
    /// `KEY=value` pairs, in order.
    pub env: Vec<String>,
}

impl AnimalOptions {
    pub fn new(args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }
}

/// One `poll_oneoff` subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub userdata: u64,
    pub kind: SubscriptionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Clock { id: u32, timeout: u64, flags: u16 },
    FdRead(u32),
    FdWrite(u32),
}

/// One `poll_oneoff` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub userdata: u64,
    pub error: Errno,
    pub kind: u8,
}

/// Everything the imports of one worker can reach.
pub struct AnimalState {
    pub fds: FdTable,
    pub options: AnimalOptions,
    pub(crate) memory: Option<SharedMemory>,
    clock_origin: Instant,
    spawner: Option<ThreadSpawner>,
}

impl AnimalState {
    pub fn new(fds: FdTable, options: AnimalOptions) -> Self {
        Self {
            fds,
            options,
            memory: None,
            clock_origin: Instant::now(),
            spawner: None,
        }
    }

    pub fn with_shared_memory(mut self, memory: SharedMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Share one monotonic origin between all workers of a farm.
    pub fn with_clock_origin(mut self, origin: Instant) -> Self {
        self.clock_origin = origin;
        self
    }

    pub fn with_spawner(mut self, spawner: ThreadSpawner) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn spawner(&self) -> Option<&ThreadSpawner> {
        self.spawner.as_ref()
    }

    /// Start a sibling running `wasi_thread_start(tid, start_arg)` and
    /// return its thread id.
    pub fn thread_spawn(&mut self, start_arg: i32) -> Result<WasiResult<i32>> {
        let spawner = self.spawner.as_ref().ok_or(RuntimeError::SpawnDisabled)?;
        let fds = self.fds.snapshot();
        spawner.spawn(start_arg, fds)
    }

    pub fn clock_res(&self, id: u32) -> WasiResult<u64> {
        match id {
            clockid::REALTIME
            | clockid::MONOTONIC
            | clockid::PROCESS_CPUTIME_ID
            | clockid::THREAD_CPUTIME_ID => Ok(1),
            _ => Err(Errno::INVAL),
        }
    }

    pub fn clock_time(&self, id: u32) -> WasiResult<u64> {
        match id {
            clockid::REALTIME => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .map_err(|_| Errno::IO),
            clockid::MONOTONIC | clockid::PROCESS_CPUTIME_ID | clockid::THREAD_CPUTIME_ID => {
                Ok(self.clock_origin.elapsed().as_nanos() as u64)
            }
            _ => Err(Errno::INVAL),
        }
    }

    pub fn random_fill(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }

    /// Wait for the first subscription to fire.
    ///
    /// Fd subscriptions are always ready, so any of them short-circuits the
    /// clocks. Otherwise the worker sleeps until the earliest clock deadline
    /// and reports every clock due by then.
    pub fn poll_oneoff(&mut self, subscriptions: &[Subscription]) -> Result<WasiResult<Vec<Event>>> {
        if subscriptions.is_empty() {
            return Ok(Err(Errno::INVAL));
        }
        self.fds.check_fds()?;

        let ready: Vec<Event> = subscriptions
            .iter()
            .filter_map(|sub| {
                let (fd, kind) = match sub.kind {
                    SubscriptionKind::FdRead(fd) => (fd, eventtype::FD_READ),
                    SubscriptionKind::FdWrite(fd) => (fd, eventtype::FD_WRITE),
                    SubscriptionKind::Clock { .. } => return None,
                };
                let error = match self.fds.entry(fd) {
                    Some(_) => Errno::SUCCESS,
                    None => Errno::BADF,
                };
                Some(Event {
                    userdata: sub.userdata,
                    error,
                    kind,
                })
            })
            .collect();
        if !ready.is_empty() {
            return Ok(Ok(ready));
        }

        let mut waits = Vec::with_capacity(subscriptions.len());
        for sub in subscriptions {
            if let SubscriptionKind::Clock { id, timeout, flags } = sub.kind {
                let wait = match self.clock_time(id) {
                    Ok(now) if flags & subclockflags::ABSTIME != 0 => {
                        Ok(Duration::from_nanos(timeout.saturating_sub(now)))
                    }
                    Ok(_) => Ok(Duration::from_nanos(timeout)),
                    Err(errno) => Err(errno),
                };
                waits.push((sub.userdata, wait));
            }
        }

        let shortest = waits
            .iter()
            .filter_map(|(_, wait)| wait.ok())
            .min()
            .unwrap_or_default();
        let has_invalid = waits.iter().any(|(_, wait)| wait.is_err());
        if !has_invalid && !shortest.is_zero() {
            thread::sleep(shortest);
        }

        Ok(Ok(waits
            .into_iter()
            .filter_map(|(userdata, wait)| {
                let error = match wait {
                    Ok(wait) if wait <= shortest && !has_invalid => Errno::SUCCESS,
                    Ok(_) => return None,
                    Err(errno) => errno,
                };
                Some(Event {
                    userdata,
                    error,
                    kind: eventtype::CLOCK,
                })
            })
            .collect()))
    }
}

/// How an entry point ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The entry point returned.
    Returned,
    /// The guest called `proc_exit`.
    ProcExit(i32),
}

impl Exit {
    pub fn code(self) -> i32 {
        match self {
            Exit::Returned => 0,
            Exit::ProcExit(code) => code,
        }
    }
}

/// Everything needed to instantiate a guest on the current thread.
#[derive(Clone)]
pub struct AnimalSetup {
    pub engine: Engine,
    pub module: Module,
    pub objects: Vec<RefObject>,
    pub options: AnimalOptions,
    pub config: FarmConfig,
    pub memory: Option<SharedMemory>,
    pub clock_origin: Instant,
}

/// A guest instance together with its WASI state.
pub struct Animal {
    store: Store<AnimalState>,
    instance: Instance,
    background: Option<WorkerBackgroundRef>,
}

impl Animal {
    /// Attach Refs, build the fd map and instantiate the module.
    ///
    /// `killed` is polled at every epoch tick; once set the guest traps with
    /// [`Terminated`].
    pub fn new(
        setup: &AnimalSetup,
        seed: FdSeed,
        background: Option<WorkerBackgroundRef>,
        killed: Arc<AtomicBool>,
    ) -> Result<Self> {
        let fds = FdTable::new(setup.objects.clone(), seed, &setup.config)?;
        let mut state = AnimalState::new(fds, setup.options.clone())
            .with_clock_origin(setup.clock_origin);
        if let Some(memory) = &setup.memory {
            state = state.with_shared_memory(memory.clone());
            if let Some(background) = &background {
                state = state.with_spawner(ThreadSpawner::new(background.clone(), &setup.config));
            }
        }

        let mut linker = Linker::new(&setup.engine);
        imports::add_to_linker(&mut linker)?;

        let mut store = Store::new(&setup.engine, state);
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(move |_| {
            if killed.load(Ordering::SeqCst) {
                Err(wasmtime::Error::new(Terminated))
            } else {
                Ok(UpdateDeadline::Continue(1))
            }
        });
        if let Some(memory) = &setup.memory {
            linker
                .define(&store, "env", "memory", memory.clone())
                .map_err(|e| RuntimeError::wasm("linker", e))?;
        }
        let instance = linker
            .instantiate(&mut store, &setup.module)
            .map_err(|e| RuntimeError::wasm("instantiate", e))?;

        Ok(Self {
            store,
            instance,
            background,
        })
    }

    pub fn state(&self) -> &AnimalState {
        self.store.data()
    }

    pub fn state_mut(&mut self) -> &mut AnimalState {
        self.store.data_mut()
    }

    fn classify(error: wasmtime::Error) -> Result<Exit> {
        if let Some(exit) = error.downcast_ref::<ProcExit>() {
            return Ok(Exit::ProcExit(exit.0));
        }
        if error.downcast_ref::<Terminated>().is_some() {
            return Err(RuntimeError::Terminated);
        }
        match error.downcast::<RuntimeError>() {
            Ok(host) => Err(host),
            Err(error) => Err(RuntimeError::WorkerFailed(SerializedError::from_wasmtime(&error))),
        }
    }

    fn enter_start(&mut self) -> Result<Exit> {
        let start = self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, "_start")
            .map_err(|e| RuntimeError::wasm("_start", e))?;
        match start.call(&mut self.store, ()) {
            Ok(()) => Ok(Exit::Returned),
            Err(error) => Self::classify(error),
        }
    }

    fn enter_thread(&mut self, tid: i32, start_arg: i32) -> Result<Exit> {
        let entry = self
            .instance
            .get_typed_func::<(i32, i32), ()>(&mut self.store, "wasi_thread_start")
            .map_err(|e| RuntimeError::wasm("wasi_thread_start", e))?;
        match entry.call(&mut self.store, (tid, start_arg)) {
            Ok(()) => Ok(Exit::Returned),
            Err(error) => Self::classify(error),
        }
    }

    /// Run `_start` on this thread and return the exit code.
    #[instrument(skip(self), level = "debug")]
    pub fn start(&mut self) -> Result<i32> {
        self.enter_start().map(Exit::code)
    }

    /// Run `_start` on the tokio blocking pool.
    pub async fn start_async(mut self) -> Result<i32> {
        tokio::task::spawn_blocking(move || self.start())
            .await
            .map_err(|e| RuntimeError::Join(e.to_string()))?
    }

    /// Run `_start` and tell the background worker how it ended.
    pub fn block_start(&mut self) -> Result<i32> {
        let outcome = self.enter_start();
        self.report(0, &outcome);
        outcome.map(Exit::code)
    }

    /// Run `wasi_thread_start(tid, start_arg)` as a spawned sibling and tell
    /// the background worker how it ended.
    #[instrument(skip(self), level = "debug")]
    pub fn thread_start(&mut self, tid: i32, start_arg: i32) -> Result<i32> {
        let outcome = self.enter_thread(tid, start_arg);
        self.report(tid, &outcome);
        outcome.map(Exit::code)
    }

    fn report(&self, tid: i32, outcome: &Result<Exit>) {
        let event = match outcome {
            Ok(Exit::Returned) => WorkerEvent::Exited { tid, code: 0 },
            Ok(Exit::ProcExit(code)) => WorkerEvent::ProcExit { tid, code: *code },
            Err(error) => WorkerEvent::Failed {
                tid,
                error: SerializedError::from_runtime(error),
            },
        };
        match &event {
            WorkerEvent::Failed { error, .. } => warn!(tid, %error, "worker failed"),
            _ => info!(tid, ?event, "worker finished"),
        }
        match &self.background {
            Some(background) => background.report(event),
            None => debug!(tid, "no background worker to report to"),
        }
    }
}
