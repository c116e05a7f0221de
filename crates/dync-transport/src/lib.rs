//! Router/dealer-style message transport for dync.
//!
//! There is no ZeroMQ dependency here: [`router`] emulates a ROUTER socket
//! over plain TCP using [`tokio_util::codec::LengthDelimitedCodec`] for
//! stream delimiting and a small per-message frame-count header (see
//! [`codec`]) for the inner multi-frame structure. Every accepted
//! connection is assigned an opaque [`router::ConnId`] and authenticates
//! once via [`auth::Authenticator`] before its envelopes are forwarded to
//! the core event loop.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod codec;
pub mod error;
pub mod router;

pub use auth::{Authenticator, CertificateDirectory};
pub use error::{Result, TransportError};
pub use router::{ConnId, Disconnected, Envelope, Origin, Router, RouterEvent};
