//! # wasi-farm runtime
//!
//! Runs one WASI Preview-1 module across several workers that share nothing
//! but explicit buffers. Guests see an ordinary process: descriptors 0/1/2,
//! files they can open, and a `thread-spawn` import whose siblings share the
//! same linear memory.
//!
//! ## Core Concepts
//!
//! ### Workers
//!
//! A **worker** is an OS thread that owns one wasmtime store and instance.
//! Workers never touch each other's instance state. What they share is:
//!
//! - the segments behind every [`Ref`](wasi_farm_park::Ref), so each worker can
//!   call into the [`Park`](wasi_farm_park::Park)s that own the descriptors
//! - the module's imported shared memory, if it has one
//! - an event channel to the background worker
//!
//! ### Animals
//!
//! An [`Animal`] is the WASI surface of one worker. It folds the fd spaces of
//! all its Refs into one fd-number space ([`FdTable`]) and answers every
//! `wasi_snapshot_preview1` import. Descriptors opened by one worker become
//! visible to the others lazily, the next time they make an fd call.
//!
//! ### Thread Spawning
//!
//! A guest blocked inside `thread-spawn` cannot start a worker itself. Its
//! [`ThreadSpawner`] asks the always-listening [`WorkerBackground`] instead,
//! which creates the sibling through a [`WorkerFactory`] and answers with the
//! new thread id. The background worker also decides when the run is over and
//! relays a [`DoneReport`] to the host's [`WorkerRef`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────── host ────────────────┐
//! │ Farm::run ── WorkerRef ◄── done ──┐  │
//! └───────────────────────────────────┼──┘
//!                                     │
//!  ┌── farm-background ──────────────┴─┐
//!  │ serve: spawn requests             │
//!  │ supervise: worker events          │
//!  └──▲────────────────▲───────────────┘
//!     │ thread-spawn   │ events
//!  ┌──┴──────────┐  ┌──┴──────────┐
//!  │ worker 0    │  │ worker 1..n │
//!  │ Animal      │  │ Animal      │
//!  │  FdTable ───┼──┼─► Ref ──────┼──► Park (descriptor owner)
//!  └─────────────┘  └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use wasi_farm_park::memfs::{ConsoleIn, ConsoleOut, MemFs};
//! use wasi_farm_park::{Descriptor, Park, ParkConfig};
//! use wasi_farm_runtime::{AnimalOptions, Farm, FarmConfig};
//!
//! let fs = MemFs::new();
//! fs.write_file("main.rs", "fn main() {}")?;
//! let descriptors: Vec<Box<dyn Descriptor>> = vec![
//!     Box::new(ConsoleIn::stdin()),
//!     Box::new(ConsoleOut::stdout()),
//!     Box::new(ConsoleOut::stderr()),
//!     Box::new(fs.preopen("/")),
//! ];
//! let park = Park::new(descriptors, ParkConfig::default())?;
//! park.listen()?;
//!
//! let engine = Farm::engine()?;
//! let farm = Farm::new(
//!     &engine,
//!     std::fs::read("app.wasm")?,
//!     vec![park.ref_object()],
//!     AnimalOptions::new(["app"]),
//!     FarmConfig::default(),
//! )?;
//! let code = farm.run()?;
//! ```

pub mod animal;
pub mod background;
pub mod config;
pub mod error;
pub mod farm;
pub mod fds;
pub mod imports;
pub mod memory;
pub mod spawner;
pub mod worker;

pub use animal::{Animal, AnimalOptions, AnimalSetup, AnimalState, Exit};
pub use background::{DoneReport, WorkerBackground, WorkerFactory, WorkerRef};
pub use config::FarmConfig;
pub use error::{ProcExit, Result, RuntimeError, SerializedError, Terminated};
pub use farm::Farm;
pub use fds::{FdEntry, FdSeed, FdTable};
pub use spawner::{SpawnRequest, ThreadSpawner, WorkerBackgroundRef};
pub use worker::{spawn_worker, WorkerEvent, WorkerHandle, WorkerKind};
