//! # CofferDB Core
//!
//! The snapshot coordinator of CofferDB: an embedded, single-file,
//! copy-on-write object database.
//!
//! A database file stores named tables inside a tree of immutable arrays.
//! The [`Group`] owns the root of that tree for one snapshot of the file:
//!
//! - attach to a file image or byte buffer and validate its root
//! - look up, create, rename, and remove named tables
//! - stream a self-contained copy of the snapshot (header, arrays, top
//!   array, streaming footer)
//! - commit atomically in place: new data goes into free space, never over
//!   live data, and a one-byte header flip publishes the new root
//! - advance an open snapshot to one committed by another writer,
//!   reconciling live table accessors through the writer's transaction log
//!
//! Concurrency is layered above: a `Group` has exactly one logical owner
//! at a time. Storage backends live in `cofferdb_storage`; the transaction
//! log grammar lives in `cofferdb_repl`.
//!
//! ## Example
//!
//! ```rust
//! use cofferdb_core::{ColumnKind, Group};
//!
//! let mut group = Group::new().unwrap();
//! let people = group.add_table("people", true).unwrap();
//! let age = group.add_column(people, ColumnKind::Int, "age", false).unwrap();
//! group.add_empty_rows(people, 1).unwrap();
//! group.set_int(people, age, 0, 42).unwrap();
//!
//! let image = group.write_to_mem().unwrap();
//! let reopened = Group::open_buffer(image).unwrap();
//! assert!(group == reopened);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod advance;
mod alloc;
mod array;
mod error;
mod group;
mod table;
mod upgrade;
mod writer;

pub use alloc::{SlabAlloc, FILE_FOOTER_SIZE, FILE_HEADER_SIZE};
pub use array::RefOrTagged;
pub use error::{CoreError, CoreResult, LogicErrorKind};
pub use group::{Group, HistoryType, OpenMode, SizeAggregate, MAX_NAME_LENGTH};
pub use table::Table;
pub use upgrade::{target_file_format_for_session, CURRENT_FILE_FORMAT};

pub use cofferdb_repl::{ColumnKind, TransactLogBuilder};
pub use cofferdb_storage::EncryptionKey;
