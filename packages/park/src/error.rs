//! Error types for descriptor ownership.
//!
//! A [`FarmError`] means the shared-memory contract between a Park and its
//! Refs is broken. Ordinary WASI failures are [`crate::Errno`] values and
//! never appear here.

use thiserror::Error;
use wasi_farm_shm::ShmError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FarmError {
    /// A segment primitive failed (no listener, double invoke, timeout, ...).
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// A handle did not refer to anything the Park owns.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// A slot carried a function id outside the operation set.
    #[error("unknown function id {0}")]
    UnknownFunction(u32),

    /// Every ref id the admin segment has room for is taken.
    #[error("ref ids exhausted (max {0})")]
    RefIdExhausted(u32),

    /// The two sides disagree about the slot contents.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A Park loop thread could not be started.
    #[error("failed to start park thread: {0}")]
    Spawn(String),
}

/// Result type alias for Park and Ref operations.
pub type Result<T> = std::result::Result<T, FarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_errors_pass_through() {
        let e: FarmError = ShmError::NoListener.into();
        assert_eq!(e.to_string(), "no listener");
    }

    #[test]
    fn unknown_function_display() {
        assert!(FarmError::UnknownFunction(99).to_string().contains("99"));
    }
}
