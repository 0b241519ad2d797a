//! The `run` command.

use std::fs;
use std::path::PathBuf;

use clap::Args;
use thiserror::Error;
use tracing::{debug, info};
use wasi_farm_park::memfs::{ConsoleIn, ConsoleOut, MemFs};
use wasi_farm_park::{Descriptor, FarmError, Park, ParkConfig};
use wasi_farm_runtime::{AnimalOptions, Farm, RuntimeError};

use crate::settings::Settings;

/// Errors that stop the runner before or while the guest runs.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid environment entry {0:?}, expected KEY=VALUE")]
    InvalidEnv(String),

    #[error("park error: {0}")]
    Farm(#[from] FarmError),

    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;

/// Arguments of `wasi-farm run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Module to run (binary or text format)
    pub module: PathBuf,

    /// Host directory copied into the guest's `/` preopen
    #[arg(long)]
    pub preload: Option<PathBuf>,

    /// Argument passed to the guest after its program name
    #[arg(long = "arg", value_name = "ARG")]
    pub args: Vec<String>,

    /// Environment variable for the guest
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// JSON file with `park` and `farm` settings
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl RunArgs {
    fn options(&self) -> Result<AnimalOptions> {
        let program = self
            .module
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "main.wasm".to_string());
        let mut options =
            AnimalOptions::new(std::iter::once(program).chain(self.args.iter().cloned()));
        for entry in &self.env {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| CliError::InvalidEnv(entry.clone()))?;
            options = options.with_env(key, value);
        }
        Ok(options)
    }
}

fn start_park(fs: &MemFs, config: ParkConfig) -> Result<Park> {
    let descriptors: Vec<Box<dyn Descriptor>> = vec![
        Box::new(ConsoleIn::stdin()),
        Box::new(ConsoleOut::stdout()),
        Box::new(ConsoleOut::stderr()),
        Box::new(fs.preopen("/")),
    ];
    let park = Park::new(descriptors, config)?;
    park.listen()?;
    Ok(park)
}

/// Run the module and return the guest's exit code.
pub fn run(args: &RunArgs) -> Result<i32> {
    let settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let options = args.options()?;

    let fs = MemFs::new();
    if let Some(dir) = &args.preload {
        let files = fs.preload(dir)?;
        info!(files, dir = %dir.display(), "preloaded host directory");
    }
    let park = start_park(&fs, settings.park)?;

    let wasm = fs::read(&args.module)?;
    let engine = Farm::engine()?;
    let farm = Farm::new(
        &engine,
        wasm,
        vec![park.ref_object()],
        options,
        settings.farm,
    )?;
    debug!(module = %args.module.display(), threaded = farm.is_threaded(), "running");
    Ok(farm.run()?)
}
