//! Error types for the wasi-farm runtime.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wasi_farm_park::FarmError;
use wasi_farm_shm::ShmError;
use wasmtime::{Trap, WasmBacktrace};

/// Errors that can occur while running workers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A Park or Ref broke the shared-memory contract.
    #[error("farm error: {0}")]
    Farm(#[from] FarmError),

    /// A segment primitive failed outside any Park.
    #[error("shared segment error: {0}")]
    Shm(#[from] ShmError),

    /// wasmtime refused to compile, link, instantiate or call.
    #[error("wasmtime {stage}: {message}")]
    Wasm { stage: &'static str, message: String },

    /// No attached Ref declares a descriptor for this stdio slot.
    #[error("no ref provides stdio fd {0}")]
    MissingStdio(u32),

    /// A worker trapped or failed to start.
    #[error("worker failed: {0}")]
    WorkerFailed(SerializedError),

    /// `thread-spawn` was called by a worker that cannot spawn.
    #[error("thread spawning is not available in this worker")]
    SpawnDisabled,

    /// The background worker stopped before answering.
    #[error("background worker is gone")]
    BackgroundGone,

    /// The worker was killed while running.
    #[error("worker terminated")]
    Terminated,

    /// A blocking-pool task failed.
    #[error("task failed: {0}")]
    Join(String),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A background message could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    pub(crate) fn wasm(stage: &'static str, error: impl fmt::Display) -> Self {
        RuntimeError::Wasm {
            stage,
            message: error.to_string(),
        }
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Trap payload raised by `proc_exit`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("process exited with code {0}")]
pub struct ProcExit(pub i32);

/// Trap payload raised when a worker's kill flag is seen.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("worker terminated")]
pub struct Terminated;

/// An error flattened so it can cross worker boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub message: String,
    pub name: String,
    pub stack: Option<String>,
    pub cause: Option<String>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: name.into(),
            stack: None,
            cause: None,
        }
    }

    /// Flatten an error returned by a wasm call.
    pub fn from_wasmtime(error: &wasmtime::Error) -> Self {
        let full = format!("{error:#}");
        let (name, message) = match error.downcast_ref::<Trap>() {
            Some(trap) => ("Trap", trap.to_string()),
            None => ("Error", error.to_string()),
        };
        Self {
            stack: error.downcast_ref::<WasmBacktrace>().map(|bt| bt.to_string()),
            cause: (full != message).then_some(full),
            message,
            name: name.to_string(),
        }
    }

    /// Flatten a host-side failure.
    pub fn from_runtime(error: &RuntimeError) -> Self {
        match error {
            RuntimeError::WorkerFailed(inner) => inner.clone(),
            RuntimeError::Terminated => Self::new("Terminated", error.to_string()),
            other => Self::new("RuntimeError", other.to_string()),
        }
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}
