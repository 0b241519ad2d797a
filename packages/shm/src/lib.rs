//! Shared-segment primitives for wasi-farm.
//!
//! This is the narrow waist of the farm. Everything at this level is words and
//! bytes in a [`SharedSegment`] - no WASI semantics, no descriptor tables.
//!
//! Use this layer for:
//! - Mutual exclusion between workers that share nothing but a segment ([`Locker`])
//! - Synchronous rendezvous calls across workers ([`Caller`] / [`Listener`])
//! - Moving variable-length payloads next to fixed RPC slots ([`Allocator`])
//!
//! # Example
//!
//! ```rust
//! use wasi_farm_shm::{Caller, Listener, SharedSegment};
//!
//! let segment = SharedSegment::new(4);
//! let mut listener = Listener::attach(segment.clone(), 0).unwrap();
//!
//! let worker = std::thread::spawn(move || {
//!     let call = listener.listen().unwrap();
//!     call.finish();
//! });
//!
//! Caller::new(segment, 0).call_and_wait().unwrap();
//! worker.join().unwrap();
//! ```
//!
//! # Blocking and async waits
//!
//! Every wait is a futex-style wait on one word of a segment. The async forms
//! (`lock_async`, `listen_async`, [`AsyncCaller`], `write_async`) park the same
//! wait on tokio's blocking pool, so they must run inside a tokio runtime.

mod allocator;
mod caller;
mod error;
mod locker;
mod segment;

pub use allocator::{Allocator, ALLOCATOR_HEADER_BYTES};
pub use caller::{call_state, AsyncCaller, Caller, Invocation, Listener, CALL_WORDS};
pub use error::{Result, ShmError};
pub use locker::{lock_state, DualLockGuard, DualLockMode, LockGuard, Locker};
pub use segment::{SharedSegment, WaitOutcome};
