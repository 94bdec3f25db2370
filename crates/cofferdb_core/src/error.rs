//! Error types for CofferDB core.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Sub-kinds of [`CoreError::Logic`]: programmer misuse that leaves the
/// group unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicErrorKind {
    /// The group (or one of its accessors) is detached.
    DetachedAccessor,
    /// The operation is not legal in the group's current state, for example
    /// committing a shared group or reopening an attached one.
    WrongGroupState,
    /// A table index was out of range.
    TableIndexOutOfRange,
    /// A table or column name exceeded the maximum length (63 bytes).
    TableNameTooLong,
}

impl fmt::Display for LogicErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogicErrorKind::DetachedAccessor => "detached accessor",
            LogicErrorKind::WrongGroupState => "wrong group state",
            LogicErrorKind::TableIndexOutOfRange => "table index out of range",
            LogicErrorKind::TableNameTooLong => "table name too long",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in CofferDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The database image failed validation and cannot be attached.
    #[error("invalid database: {message} ({path})")]
    InvalidDatabase {
        /// Description of the validation failure.
        message: String,
        /// Path of the offending file, empty for in-memory images.
        path: String,
    },

    /// Programmer misuse; the group state is unchanged.
    #[error("logic error: {0}")]
    Logic(LogicErrorKind),

    /// No table with the given name exists.
    #[error("no such table")]
    NoSuchTable,

    /// A table with the given name already exists.
    #[error("table name already in use")]
    TableNameInUse,

    /// The table is the target of link columns of another table and cannot
    /// be removed.
    #[error("table is the target of a cross-table link column")]
    CrossTableLinkTarget,

    /// A table's on-disk descriptor does not match the expected one.
    #[error("descriptor mismatch")]
    DescriptorMismatch,

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] cofferdb_storage::StorageError),

    /// Transaction log error.
    #[error("transaction log error: {0}")]
    Log(#[from] cofferdb_repl::LogError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Creates an invalid database error.
    pub fn invalid_database(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::InvalidDatabase {
            message: message.into(),
            path: path.into(),
        }
    }

    /// Creates a detached accessor error.
    #[must_use]
    pub fn detached_accessor() -> Self {
        Self::Logic(LogicErrorKind::DetachedAccessor)
    }

    /// Creates a wrong group state error.
    #[must_use]
    pub fn wrong_group_state() -> Self {
        Self::Logic(LogicErrorKind::WrongGroupState)
    }

    /// Creates a table index out of range error.
    #[must_use]
    pub fn table_index_out_of_range() -> Self {
        Self::Logic(LogicErrorKind::TableIndexOutOfRange)
    }

    /// Creates a table name too long error.
    #[must_use]
    pub fn table_name_too_long() -> Self {
        Self::Logic(LogicErrorKind::TableNameTooLong)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logic_error_display() {
        let err = CoreError::table_name_too_long();
        assert_eq!(err.to_string(), "logic error: table name too long");
    }

    #[test]
    fn invalid_database_carries_path() {
        let err = CoreError::invalid_database("bad top array", "/tmp/x.coffer");
        assert!(err.to_string().contains("/tmp/x.coffer"));
    }
}
