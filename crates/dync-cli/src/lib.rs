//! Shared CLI plumbing for the `dync-server` and `dync-client` binaries:
//! YAML config loading and upload progress display.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod progress;
