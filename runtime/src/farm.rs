//! A compiled module plus the Refs and options every worker of a run gets.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasi_farm_park::RefObject;
use wasmtime::{Config, Engine, ExternType, Module, SharedMemory};

use crate::animal::{Animal, AnimalOptions, AnimalSetup};
use crate::background::{DoneReport, WorkerBackground, WorkerFactory};
use crate::config::FarmConfig;
use crate::error::{Result, RuntimeError, SerializedError};
use crate::fds::FdSeed;
use crate::spawner::{SpawnRequest, WorkerBackgroundRef};
use crate::worker::{spawn_worker, WorkerEvent, WorkerHandle, WorkerKind};

/// Instantiates the farm's module in thread mode for the background worker.
struct ModuleFactory {
    setup: AnimalSetup,
}

impl WorkerFactory for ModuleFactory {
    fn spawn_thread(
        &self,
        tid: i32,
        request: SpawnRequest,
        background: WorkerBackgroundRef,
    ) -> Result<WorkerHandle> {
        spawn_worker(
            self.setup.clone(),
            WorkerKind::Thread {
                tid,
                start_arg: request.start_arg,
            },
            FdSeed::Snapshot(request.fds),
            Some(background),
        )
    }
}

/// One WASI program ready to run across workers.
///
/// If the module imports a shared memory, the farm creates it once and every
/// worker links the same memory, which is what makes `thread-spawn` work.
/// Modules with a private memory run single-threaded and `thread-spawn`
/// returns an error to the guest.
#[derive(Clone)]
pub struct Farm {
    engine: Engine,
    module: Module,
    memory: Option<SharedMemory>,
    objects: Vec<RefObject>,
    options: AnimalOptions,
    config: FarmConfig,
    clock_origin: Instant,
}

impl Farm {
    /// An engine with the features workers rely on: shared memories for
    /// siblings, epoch interruption for termination.
    pub fn engine() -> Result<Engine> {
        let mut config = Config::new();
        config.wasm_threads(true);
        config.shared_memory(true);
        config.epoch_interruption(true);
        Engine::new(&config).map_err(|e| RuntimeError::wasm("engine", e))
    }

    /// Compile `wasm` (binary or text) for a farm over `objects`.
    pub fn new(
        engine: &Engine,
        wasm: impl AsRef<[u8]>,
        objects: Vec<RefObject>,
        options: AnimalOptions,
        config: FarmConfig,
    ) -> Result<Self> {
        let module =
            Module::new(engine, wasm.as_ref()).map_err(|e| RuntimeError::wasm("compile", e))?;
        Self::from_module(engine, module, objects, options, config)
    }

    pub fn from_module(
        engine: &Engine,
        module: Module,
        objects: Vec<RefObject>,
        options: AnimalOptions,
        config: FarmConfig,
    ) -> Result<Self> {
        let mut memory = None;
        for import in module.imports() {
            if let ExternType::Memory(ty) = import.ty() {
                if ty.is_shared() {
                    debug!(module = import.module(), name = import.name(), "module imports shared memory");
                    memory = Some(
                        SharedMemory::new(engine, ty)
                            .map_err(|e| RuntimeError::wasm("shared memory", e))?,
                    );
                }
            }
        }

        Ok(Self {
            engine: engine.clone(),
            module,
            memory,
            objects,
            options,
            config,
            clock_origin: Instant::now(),
        })
    }

    pub fn is_threaded(&self) -> bool {
        self.memory.is_some()
    }

    pub fn config(&self) -> &FarmConfig {
        &self.config
    }

    fn setup(&self) -> AnimalSetup {
        AnimalSetup {
            engine: self.engine.clone(),
            module: self.module.clone(),
            objects: self.objects.clone(),
            options: self.options.clone(),
            config: self.config.clone(),
            memory: self.memory.clone(),
            clock_origin: self.clock_origin,
        }
    }

    /// Instantiate the module on the current thread, without a background
    /// worker. The animal cannot spawn threads.
    pub fn animal(&self) -> Result<Animal> {
        Animal::new(
            &self.setup(),
            FdSeed::Initial,
            None,
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// Run `_start` on a worker under a background worker and wait for the
    /// farm to end.
    #[instrument(skip(self), level = "debug")]
    pub fn run_report(&self) -> Result<DoneReport> {
        let setup = self.setup();
        let factory = Arc::new(ModuleFactory {
            setup: setup.clone(),
        });
        let (worker_ref, background) = WorkerBackground::spawn(factory, &self.config)?;
        match spawn_worker(setup, WorkerKind::Start, FdSeed::Initial, Some(background.clone())) {
            Ok(handle) => background.adopt(handle),
            Err(e) => {
                // Let the background worker wind down before giving up.
                background.report(WorkerEvent::Failed {
                    tid: 0,
                    error: SerializedError::from_runtime(&e),
                });
                worker_ref.wait()?;
                return Err(e);
            }
        }
        drop(background);

        let report = worker_ref.wait()?;
        info!(exit_code = report.exit_code, threads = report.threads.len(), "farm finished");
        Ok(report)
    }

    /// Like [`Farm::run_report`], but a worker failure becomes
    /// [`RuntimeError::WorkerFailed`].
    pub fn run(&self) -> Result<i32> {
        let report = self.run_report()?;
        match report.error {
            Some(error) => Err(RuntimeError::WorkerFailed(error)),
            None => Ok(report.exit_code),
        }
    }

    pub async fn run_async(&self) -> Result<i32> {
        let farm = self.clone();
        tokio::task::spawn_blocking(move || farm.run())
            .await
            .map_err(|e| RuntimeError::Join(e.to_string()))?
    }
}
