//! Error types for the shared-segment layer.
//!
//! Every error here is a protocol violation or an exhausted resource. Ordinary
//! WASI failures never surface at this level.

use thiserror::Error;

/// Errors raised by segment primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShmError {
    /// A call was made while no listener is attached to the word pair.
    #[error("no listener")]
    NoListener,

    /// A call was made while another call is still outstanding on the same word pair.
    #[error("call already in flight (state {0})")]
    InFlight(u32),

    /// A second listener tried to attach to a word pair.
    #[error("listener already attached")]
    ListenerAlreadyAttached,

    /// Blocking and async listening were mixed on one listener without a reset.
    #[error("blocking and async waits mixed on one listener")]
    ModeMismatch,

    /// An allocation would not fit in the fixed region.
    #[error("allocator capacity exceeded: requested {requested} bytes, {available} available")]
    CapacityExceeded { requested: usize, available: usize },

    /// A byte range fell outside the segment.
    #[error("range {offset}+{len} outside segment of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// A wait ran past its deadline.
    #[error("wait timed out")]
    Timeout,

    /// A call ran past its deadline after the listener picked it up. The
    /// listener finishes it alone and keeps any results.
    #[error("call abandoned after pickup")]
    Abandoned,

    /// A word held a value the protocol does not allow at this point.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A blocking-pool task backing an async wait failed.
    #[error("async wait failed: {0}")]
    Join(String),
}

/// Result type alias for segment operations.
pub type Result<T> = std::result::Result<T, ShmError>;
