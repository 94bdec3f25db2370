//! # CofferDB Replication
//!
//! Transaction log grammar and codec for CofferDB.
//!
//! A writer that mutates a group while replication is installed produces a
//! **transaction log**: a flat sequence of instructions describing the
//! schema- and row-level consequences of the transaction. A peer holding an
//! older snapshot of the same file consumes that log in
//! `Group::advance_transact` to reconcile its live table accessors with the
//! new on-disk shape before reattaching.
//!
//! The log is a compact binary format: one opcode byte per instruction
//! followed by LEB128 varints; strings are length-prefixed UTF-8.
//!
//! This crate has no knowledge of the file format. It only defines the
//! instruction grammar, the [`TransactLogBuilder`] producer, and the
//! [`TransactLogParser`] consumer.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod instruction;

pub use codec::{TransactLogBuilder, TransactLogParser};
pub use error::{LogError, LogResult};
pub use instruction::{ColumnKind, Instruction};
