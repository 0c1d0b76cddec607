//! Error types for framelink.

use std::sync::Arc;

use thiserror::Error;

/// Main error type for all framelink operations.
///
/// Variants are sentinels rather than a hierarchy; callers match on the
/// variant. The type is `Clone` so a terminal cause can be stored in the
/// endpoint's error slot and simultaneously returned to the caller whose
/// operation triggered it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// I/O error from the underlying socket, including deadline expiry.
    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),

    /// The endpoint is or became closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Attempt to send a packet with a reserved operation (0..=9).
    #[error("invalid or reserved operation")]
    InvalidOperation,

    /// Declared content length disagrees with the content buffer length.
    #[error("invalid content length")]
    InvalidContentLength,

    /// Internal buffer invariant violated (buffer shorter than a header).
    #[error("invalid buffer length")]
    InvalidBufferLength,

    /// A bounded packet queue was full; the connection cannot keep up.
    #[error("packet queue is full")]
    QueueFull,

    /// TLS operation called on a plain (non-TLS) connection.
    #[error("not a TLS connection")]
    NotTlsConnection,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Result type alias using framelink's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
