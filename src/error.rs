//! Error types for mongowire.
//!
//! Errors are `Clone` so that a fatal error latched on a connection or a
//! cursor can be handed back verbatim on every later call. Sources that are
//! not themselves clonable are held behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Main error type for all driver operations.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// I/O error while dialing, writing or reading the socket.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// A read or write did not complete within the configured deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The connection was closed by the caller.
    #[error("connection closed")]
    ConnectionClosed,

    /// A read or write was abandoned partway through a message, leaving the
    /// stream out of step with the framing.
    #[error("I/O interrupted mid-frame")]
    Interrupted,

    /// Protocol violation (bad opcode, corrupted length, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server no longer knows the cursor we asked for.
    #[error("cursor not found")]
    CursorNotFound,

    /// The server rejected the query. Holds `$err` when the server sent one.
    #[error("query failure: {0}")]
    QueryFailure(String),

    /// The cursor was closed by the caller.
    #[error("cursor closed")]
    CursorClosed,

    /// No more documents are available on this cursor.
    #[error("no more results")]
    EndOfResults,

    /// Document serialization failed.
    #[error("BSON encode error: {0}")]
    Encode(Arc<bson::ser::Error>),

    /// Document deserialization failed.
    #[error("BSON decode error: {0}")]
    Decode(Arc<bson::de::Error>),

    /// Caller passed something that cannot be put on the wire.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Coarse classification of a [`DriverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Dial, write or read failure. Fatal to the connection.
    Connection,
    /// Malformed traffic from the server. Fatal to the connection.
    Protocol,
    /// Server-reported cursor failure. Fatal to that cursor only.
    Cursor,
    /// Terminal sentinel, not a failure.
    EndOfResults,
    /// Document codec failure.
    Codec,
    /// Rejected before any I/O.
    Usage,
}

impl DriverError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Io(_)
            | DriverError::Timeout(_)
            | DriverError::ConnectionClosed
            | DriverError::Interrupted => ErrorKind::Connection,
            DriverError::Protocol(_) => ErrorKind::Protocol,
            DriverError::CursorNotFound
            | DriverError::QueryFailure(_)
            | DriverError::CursorClosed => ErrorKind::Cursor,
            DriverError::EndOfResults => ErrorKind::EndOfResults,
            DriverError::Encode(_) | DriverError::Decode(_) => ErrorKind::Codec,
            DriverError::InvalidArgument(_) => ErrorKind::Usage,
        }
    }

    /// Check if this is the end-of-results sentinel.
    #[inline]
    pub fn is_end_of_results(&self) -> bool {
        matches!(self, DriverError::EndOfResults)
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Io(Arc::new(err))
    }
}

impl From<bson::ser::Error> for DriverError {
    fn from(err: bson::ser::Error) -> Self {
        DriverError::Encode(Arc::new(err))
    }
}

impl From<bson::de::Error> for DriverError {
    fn from(err: bson::de::Error) -> Self {
        DriverError::Decode(Arc::new(err))
    }
}

/// Result type alias using DriverError.
pub type Result<T> = std::result::Result<T, DriverError>;
