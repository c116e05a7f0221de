//! Dropbox destination resolution, staging, and atomic landing for dync
//! uploads.
//!
//! Uploads never write directly into a dropbox: they accumulate in a
//! per-upload staging directory under a configured temp root, and only
//! become visible at their final destination once [`staging::Storage::finalize`]
//! has verified the checksum and renamed the whole staging directory into
//! place.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dropbox;
pub mod error;
pub mod staging;

pub use dropbox::{
    clean_filename, extract_barcode, generate_openbis_name, is_valid_barcode, DropboxConfig,
    DropboxRule,
};
pub use error::{Result, StorageError};
pub use staging::{StagingFile, Storage};
