//! # duraheap
//!
//! A persistent, file-backed heap manager. A datastore directory holds a
//! growable data segment that is memory-mapped into a reserved, aligned
//! virtual-memory window; objects constructed inside it survive process
//! exit and can be reopened, snapshotted, and copied.
//!
//! Interior references stored in persisted objects must stay valid when
//! the segment is remapped at a different address in a later session, so
//! everything below the public surface speaks *offsets*: the chunk-based
//! allocator hands out offsets, the named-object directory records
//! offsets, and only the manager translates them to process-local
//! addresses against the live segment base.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use duraheap::Manager;
//!
//! // First session: create and populate.
//! let manager = Manager::create("/tmp/ds", 64 * 1024 * 1024)?;
//! manager.construct::<i32>("counter", 42).unwrap();
//! manager.close()?;
//!
//! // Later session: reopen and look up by name.
//! let manager = Manager::open_read_only("/tmp/ds")?;
//! let (counter, len) = manager.find::<i32>("counter").unwrap();
//! assert_eq!((unsafe { *counter.as_ref() }, len), (42, 1));
//! ```
//!
//! ## Durability
//!
//! [`Manager::flush`] makes prior mutations durable; a clean close (or
//! drop) additionally writes the properly-closed marker that a subsequent
//! open requires. [`Manager::snapshot`] clones the datastore with a fresh
//! UUID while the source stays open.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocator;
pub mod directory;
pub mod error;
pub mod header;
pub mod manager;
pub mod platform;
pub mod segment;
pub mod version;

pub use directory::{ObjectEntry, ObjectKind};
pub use error::{Error, Result};
pub use manager::{Manager, CHUNK_SIZE};
