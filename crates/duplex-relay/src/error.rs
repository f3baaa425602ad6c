//! Relay error types
//!
//! Every error is scoped to a single pair. A clean EOF is not an error; it
//! drives the graceful close path instead.

use crate::side::Side;
use std::fmt;
use thiserror::Error;

/// Errors that terminate a relay pair
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Read from side {side} failed: {source}")]
    Read {
        side: Side,
        #[source]
        source: std::io::Error,
    },

    #[error("Write to side {side} failed: {source}")]
    Write {
        side: Side,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Class of a pair-fatal failure, as reported to diagnostic sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The source side failed to produce data
    Read,
    /// The destination side rejected a chunk, a flush or a shutdown
    Write,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Read => f.write_str("read"),
            ErrorKind::Write => f.write_str("write"),
        }
    }
}

impl RelayError {
    /// The side whose connection produced the error
    pub fn side(&self) -> Side {
        match self {
            RelayError::Read { side, .. } | RelayError::Write { side, .. } => *side,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Read { .. } => ErrorKind::Read,
            RelayError::Write { .. } => ErrorKind::Write,
        }
    }

    /// The underlying I/O error kind
    pub fn io_kind(&self) -> std::io::ErrorKind {
        match self {
            RelayError::Read { source, .. } | RelayError::Write { source, .. } => source.kind(),
        }
    }
}
