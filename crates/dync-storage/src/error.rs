//! Error types for the dropbox storage layer.

use thiserror::Error;

/// Errors raised while resolving, staging, or landing an upload.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The filename failed sanitization or no dropbox rule matched it.
    #[error("invalid upload request: {0}")]
    InvalidUploadRequest(String),

    /// The destination path is already reserved by another in-flight upload,
    /// or already exists on disk.
    #[error("destination already exists: {0}")]
    DestinationTaken(String),

    /// The remote-supplied checksum did not match the bytes actually written.
    #[error("failed finalizing file: checksum mismatch")]
    ChecksumMismatch,

    /// Landing the staged file (rename, fsync, sidecar writes) failed.
    #[error("failed finalizing file: {0}")]
    LandingFailure(String),

    /// A configured dropbox rule is malformed (bad regex, relative path, ...).
    #[error("invalid dropbox configuration: {0}")]
    InvalidConfig(String),

    /// Any other I/O failure while staging or landing a file.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Numeric label used on the wire. Storage failures are always reported
    /// to the client as `500`; the distinction between "bad request" and
    /// "internal error" lives in the message text, not in the wire code.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            StorageError::InvalidUploadRequest(_)
            | StorageError::DestinationTaken(_)
            | StorageError::InvalidConfig(_) => 500,
            StorageError::ChecksumMismatch | StorageError::LandingFailure(_) => 500,
            StorageError::Io(_) => 500,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StorageError>;
