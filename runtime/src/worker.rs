//! Worker threads.
//!
//! A worker is a dedicated OS thread owning one [`Animal`]. Workers share
//! nothing but segments, the farm's shared memory and the event channel to
//! the background worker; they are stopped through a kill flag that the guest
//! observes at its next epoch check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use wasmtime::Engine;

use crate::animal::{Animal, AnimalSetup};
use crate::error::{Result, SerializedError};
use crate::fds::FdSeed;
use crate::spawner::WorkerBackgroundRef;

/// Which entry point a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// The main worker, running `_start` as thread id 0.
    Start,
    /// A sibling running `wasi_thread_start(tid, start_arg)`.
    Thread { tid: i32, start_arg: i32 },
}

impl WorkerKind {
    pub fn tid(&self) -> i32 {
        match self {
            WorkerKind::Start => 0,
            WorkerKind::Thread { tid, .. } => *tid,
        }
    }
}

/// What a worker tells the background worker when it stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// The entry point returned.
    Exited { tid: i32, code: i32 },
    /// The guest called `proc_exit`, ending the whole farm.
    ProcExit { tid: i32, code: i32 },
    /// The worker trapped, was killed, or never started.
    Failed { tid: i32, error: SerializedError },
}

impl WorkerEvent {
    pub fn tid(&self) -> i32 {
        match self {
            WorkerEvent::Exited { tid, .. }
            | WorkerEvent::ProcExit { tid, .. }
            | WorkerEvent::Failed { tid, .. } => *tid,
        }
    }
}

/// Handle to a running worker.
pub struct WorkerHandle {
    tid: i32,
    killed: Arc<AtomicBool>,
    engine: Engine,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("tid", &self.tid)
            .field("killed", &self.killed.load(Ordering::Relaxed))
            .finish()
    }
}

impl WorkerHandle {
    pub fn tid(&self) -> i32 {
        self.tid
    }

    /// Ask the worker to stop. A guest blocked inside a host call stops once
    /// the call returns.
    pub fn terminate(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.engine.increment_epoch();
    }
}

/// Start a worker thread running `kind`.
pub fn spawn_worker(
    setup: AnimalSetup,
    kind: WorkerKind,
    seed: FdSeed,
    background: Option<WorkerBackgroundRef>,
) -> Result<WorkerHandle> {
    let tid = kind.tid();
    let killed = Arc::new(AtomicBool::new(false));
    let engine = setup.engine.clone();
    let flag = killed.clone();

    // Workers are detached; the background worker learns of their end
    // through events.
    thread::Builder::new()
        .name(format!("farm-worker-{tid}"))
        .spawn(move || run(setup, kind, seed, background, flag))?;
    debug!(tid, "worker spawned");

    Ok(WorkerHandle {
        tid,
        killed,
        engine,
    })
}

fn run(
    setup: AnimalSetup,
    kind: WorkerKind,
    seed: FdSeed,
    background: Option<WorkerBackgroundRef>,
    killed: Arc<AtomicBool>,
) {
    let tid = kind.tid();
    let mut animal = match Animal::new(&setup, seed, background.clone(), killed) {
        Ok(animal) => animal,
        Err(e) => {
            error!(tid, error = %e, "worker could not start");
            if let Some(background) = background {
                background.report(WorkerEvent::Failed {
                    tid,
                    error: SerializedError::from_runtime(&e),
                });
            }
            return;
        }
    };
    // Outcomes are reported to the background worker from inside the start calls.
    let _ = match kind {
        WorkerKind::Start => animal.block_start(),
        WorkerKind::Thread { tid, start_arg } => animal.thread_start(tid, start_arg),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tags() {
        let json = serde_json::to_value(WorkerEvent::ProcExit { tid: 2, code: 7 }).unwrap();
        assert_eq!(json["event"], "proc_exit");
        assert_eq!(json["tid"], 2);
    }

    #[test]
    fn kinds_know_their_tid() {
        assert_eq!(WorkerKind::Start.tid(), 0);
        assert_eq!(WorkerKind::Thread { tid: 3, start_arg: 9 }.tid(), 3);
    }
}
