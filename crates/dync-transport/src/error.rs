//! Error types for the router/dealer transport layer.

use thiserror::Error;

/// Errors raised while framing, routing, or authenticating connections.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying byte stream could not be read or written.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame envelope violated the wire format: zero frames, a frame
    /// length that would exceed the connection's length-delimited codec
    /// maximum, or a truncated frame-count header.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A message was addressed to a connection id the router no longer
    /// tracks (the peer already disconnected, or the id was never valid).
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// A certificate file under the trusted-certificates directory could
    /// not be parsed.
    #[error("invalid certificate {path}: {reason}")]
    InvalidCertificate {
        /// Path of the offending certificate file.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The peer presented no certificate, or one absent from the trusted
    /// directory, and the server is configured to require one.
    #[error("peer not authenticated")]
    Unauthenticated,

    /// The background authenticator thread hung up unexpectedly.
    #[error("authenticator thread unavailable")]
    AuthenticatorGone,
}

impl TransportError {
    /// Numeric label reported to the client, mirroring [`crate::error::Error::code`]
    /// in `dync-core`.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            TransportError::Io(_) => 500,
            TransportError::MalformedEnvelope(_) => 400,
            TransportError::UnknownConnection(_) => 404,
            TransportError::InvalidCertificate { .. } => 500,
            TransportError::Unauthenticated => 401,
            TransportError::AuthenticatorGone => 500,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, TransportError>;
