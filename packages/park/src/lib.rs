//! Descriptor ownership for wasi-farm.
//!
//! A [`Park`] owns real descriptors and serves WASI Preview-1 operations on
//! them from one loop thread per fd. A [`Ref`] is the other end: built from a
//! [`RefObject`] on any worker, it marshals calls into the Park's slots and
//! blocks until the Park answers.
//!
//! Two error layers run through every call:
//! - [`FarmError`]: the shared-memory contract broke (no listener, protocol
//!   fault, timeout). The caller should treat the Park as gone.
//! - [`Errno`]: the operation itself failed, exactly as a guest should see it.
//!
//! # Example
//!
//! ```rust
//! use wasi_farm_park::memfs::{ConsoleIn, ConsoleOut, MemFs};
//! use wasi_farm_park::{rights, Descriptor, Park, ParkConfig, Ref};
//!
//! let fs = MemFs::new();
//! fs.write_file("hello.txt", "hi there").unwrap();
//!
//! let (stdout, _captured) = ConsoleOut::capture();
//! let (stderr, _) = ConsoleOut::capture();
//! let descriptors: Vec<Box<dyn Descriptor>> = vec![
//!     Box::new(ConsoleIn::from_bytes("")),
//!     Box::new(stdout),
//!     Box::new(stderr),
//!     Box::new(fs.preopen("/")),
//! ];
//! let park = Park::new(descriptors, ParkConfig::default()).unwrap();
//! park.listen().unwrap();
//!
//! let remote = Ref::new(park.ref_object()).unwrap();
//! let fd = remote
//!     .path_open(3, 0, b"hello.txt", 0, rights::ALL, rights::ALL, 0)
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(remote.fd_read(fd, 64).unwrap().unwrap(), b"hi there");
//! ```

mod config;
mod descriptor;
mod error;
pub mod layout;
pub mod memfs;
mod ops;
mod park;
mod remote;
pub mod wasi;

pub use config::ParkConfig;
pub use descriptor::Descriptor;
pub use error::{FarmError, Result};
pub use ops::{AdminOp, FdOp};
pub use park::Park;
pub use remote::{Notifications, Ref, RefObject};
pub use wasi::{
    fdflags, lookupflags, oflags, rights, DirEntry, Errno, Fdflags, Fdstat, Filestat, Filetype,
    Lookupflags, Oflags, Prestat, Rights, WasiResult, Whence,
};
