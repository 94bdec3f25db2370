//! Error types for transaction log encoding and parsing.

use thiserror::Error;

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur while parsing a transaction log.
#[derive(Debug, Error)]
pub enum LogError {
    /// The log ended in the middle of an instruction.
    #[error("unexpected end of transaction log at offset {offset}")]
    UnexpectedEof {
        /// Byte offset where more input was expected.
        offset: usize,
    },

    /// An unknown instruction opcode was encountered.
    #[error("unknown instruction opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode {
        /// The unrecognized opcode byte.
        opcode: u8,
        /// Byte offset of the opcode.
        offset: usize,
    },

    /// An unknown column kind code was encountered.
    #[error("unknown column kind {code}")]
    UnknownColumnKind {
        /// The unrecognized column kind code.
        code: u8,
    },

    /// A varint was too large for its target type.
    #[error("varint overflow at offset {offset}")]
    VarintOverflow {
        /// Byte offset of the varint.
        offset: usize,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in string field at offset {offset}")]
    InvalidUtf8 {
        /// Byte offset of the string field.
        offset: usize,
    },
}
