//! Crate-wide error type

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client, the polling engine and the transport layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Interface lookup, socket creation or bind failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Duplicate request/command or an argument outside its valid range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A decoding formula violated the grammar.
    #[error("formula parse error at offset {offset}: {reason}")]
    Parse { offset: usize, reason: String },

    /// The request or command outlived the client/protocol that owned it.
    #[error("parent client or protocol no longer exists")]
    Detached,

    /// The requested transport is not compiled into this build.
    #[error("transport not supported: {0}")]
    Unsupported(String),
}
