//! # wasi-farm-cli
//!
//! Runs a WASI Preview-1 module over an in-memory filesystem.
//!
//! The module sees a single preopen, `/`, filled from a host directory, and
//! the host process's stdin, stdout and stderr. The process exits with the
//! guest's exit code.
//!
//! ## Usage
//!
//! ```bash
//! # Run a module against the files under ./project
//! wasi-farm run app.wasm --preload ./project --arg build --env RUST_LOG=info
//!
//! # Tune Park and farm limits from a JSON file
//! wasi-farm run app.wasm --config farm.json
//! ```
//!
//! A config file holds `{"park": {...}, "farm": {...}}`; missing fields keep
//! their defaults. Logging goes to stderr and is filtered by `WASI_FARM_LOG`.

pub mod run;
pub mod settings;

pub use run::{run, CliError, Result, RunArgs};
pub use settings::Settings;
