//! # dync-core
//!
//! The upload coordinator at the heart of dync: wire codec, credit-based
//! flow control, per-connection session state machine, the server's
//! single-threaded event loop, and the symmetric client session that drives
//! one upload to completion.
//!
//! ## Module structure
//!
//! - [`codec`]: wire messages and their framing into/out of
//!   [`dync_transport`] frame lists.
//! - [`flow`]: credit/debt bookkeeping shared by every session.
//! - [`session`]: one upload's state machine, independent of the transport.
//! - [`server`]: the event loop that owns all sessions and drives them from
//!   router events.
//! - [`client`]: the client-side counterpart, including the bounded replay
//!   buffer that makes resumption possible.
//! - [`error`]: the error taxonomy shared across this crate.
//!
//! ## Quick start (server)
//!
//! ```no_run
//! use dync_core::{Server, FlowConfig};
//! use dync_storage::{DropboxConfig, Storage};
//! use dync_transport::{Authenticator, CertificateDirectory, Router};
//! use tokio::sync::mpsc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let storage = Storage::new("/tmp/dync-staging".into(), DropboxConfig {
//!     path: "/tmp/dropbox".into(),
//!     manual: "/tmp/dropbox".into(),
//!     dropboxes: vec![],
//! });
//! let router = Router::new();
//! let auth = std::sync::Arc::new(Authenticator::spawn(CertificateDirectory::empty()));
//! let (tx, rx) = mpsc::channel(256);
//!
//! let router_task = router.clone();
//! tokio::spawn(async move {
//!     router_task.serve("0.0.0.0:8889".parse().unwrap(), tx, auth).await
//! });
//!
//! let mut server = Server::new(router, storage, FlowConfig::default(), rx);
//! server.serve().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod codec;
pub mod error;
pub mod flow;
pub mod server;
pub mod session;

pub use client::{ClientSession, UploadFile};
pub use codec::{ClientToServer, ServerToClient};
pub use error::{Error, Result};
pub use flow::{DebtTracker, FlowConfig};
pub use server::Server;
pub use session::{SessionOutcome, SessionState, UploadSession};
