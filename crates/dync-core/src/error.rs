//! Error types for the upload protocol core: message validation, session
//! state machine, and server loop.

use thiserror::Error;

use dync_storage::StorageError;
use dync_transport::TransportError;

/// Errors raised while decoding a wire message, driving a session's state
/// machine, or running the server loop.
#[derive(Debug, Error)]
pub enum Error {
    /// A message was malformed: wrong frame count, non-UTF8 text frame,
    /// invalid JSON metadata, or a command byte with no known variant.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A message referenced a connection or upload id the server has no
    /// record of, e.g. a `send-chunk` for an id that never received an
    /// `add-upload-request`.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// A client attempted an operation not valid in the session's current
    /// state, e.g. `send-chunk` before the upload was approved.
    #[error("invalid state for operation: session is {0}")]
    InvalidState(&'static str),

    /// A session received no message before its configured timeout and was
    /// dropped.
    #[error("session timed out")]
    Timeout,

    /// The server is shutting down and can no longer accept or continue
    /// sessions.
    #[error("server is shutting down")]
    ServerShutdown,

    /// Destination resolution, staging, or atomic landing failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The transport layer (connection registry, framing, authentication)
    /// failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A local read/write failed: the source file on the client side, or a
    /// socket operation that isn't already wrapped by [`Error::Transport`].
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other failure that does not fit the taxonomy above.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Numeric label reported to the client in an `error` message, per the
    /// wire protocol's small error taxonomy.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Error::InvalidMessage(_) | Error::InvalidState(_) => 400,
            Error::UnknownConnection(_) => 404,
            Error::Timeout => 408,
            Error::ServerShutdown => 503,
            Error::Storage(e) => e.code(),
            Error::Transport(e) => e.code(),
            Error::Io(_) => 500,
            Error::Internal(_) => 500,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
