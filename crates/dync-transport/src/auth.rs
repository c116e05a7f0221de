//! Certificate-directory authentication, decoupled onto a background
//! thread.
//!
//! This is not a hardened transport-security layer: there is no TLS here,
//! and a connection's "certificate" is a bearer token matched against a
//! directory of trusted tokens loaded from disk, mirroring the ZAP-style
//! certificate lookup of the original implementation's authenticator.
//! Anything stronger (mutual TLS, short-lived credentials) is out of
//! scope; this exists to keep the wire-level notion of a verified
//! [`Origin`](crate::router::Origin) separate from "any TCP peer that
//! connected".
//!
//! Loading and matching certificates runs on a dedicated OS thread reached
//! through a [`crossbeam_channel`], so a slow or contended certificate
//! directory never blocks the async accept loop or the single-threaded
//! core event loop.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tokio::sync::oneshot;

use crate::error::{Result, TransportError};
use crate::router::Origin;

/// A loaded set of trusted tokens, mapping each to the origin identity it
/// authenticates as.
#[derive(Debug, Clone, Default)]
pub struct CertificateDirectory {
    tokens: HashMap<String, String>,
}

impl CertificateDirectory {
    /// Load every `*.cert` file under `dir`. Each file's name (without
    /// extension) is the origin identity; its contents, trimmed, is the
    /// bearer token that authenticates as that identity.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut tokens = HashMap::new();
        let entries = fs::read_dir(dir)?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("cert") {
                continue;
            }
            let identity = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| TransportError::InvalidCertificate {
                    path: path.display().to_string(),
                    reason: "non-UTF8 file name".into(),
                })?
                .to_string();
            let token = fs::read_to_string(&path)?.trim().to_string();
            if token.is_empty() {
                return Err(TransportError::InvalidCertificate {
                    path: path.display().to_string(),
                    reason: "empty certificate".into(),
                });
            }
            tokens.insert(token, identity);
        }
        Ok(CertificateDirectory { tokens })
    }

    /// An empty directory that authenticates no one. Useful for tests and
    /// for a server configured to run without authentication.
    #[must_use]
    pub fn empty() -> Self {
        CertificateDirectory {
            tokens: HashMap::new(),
        }
    }

    /// Register a token directly, bypassing the filesystem. Used by tests.
    pub fn insert(&mut self, token: impl Into<String>, identity: impl Into<String>) {
        self.tokens.insert(token.into(), identity.into());
    }

    fn verify(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

struct AuthRequest {
    token: String,
    reply: oneshot::Sender<Option<String>>,
}

/// Bridges the async accept loop to a background certificate-matching
/// thread.
pub struct Authenticator {
    request_tx: crossbeam_channel::Sender<AuthRequest>,
}

impl Authenticator {
    /// Spawn the background thread owning `certs`.
    #[must_use]
    pub fn spawn(certs: CertificateDirectory) -> Self {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<AuthRequest>();

        std::thread::Builder::new()
            .name("dync-authenticator".into())
            .spawn(move || {
                while let Ok(request) = request_rx.recv() {
                    let result = certs.verify(&request.token);
                    let _ = request.reply.send(result);
                }
            })
            .expect("failed to spawn authenticator thread");

        Authenticator { request_tx }
    }

    /// Authenticate a bearer token presented by a connecting peer. Returns
    /// `None` if the token is unknown or the authenticator thread has
    /// already shut down.
    pub async fn authenticate(&self, token: &str) -> Option<Origin> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = AuthRequest {
            token: token.to_string(),
            reply: reply_tx,
        };
        if self.request_tx.send(request).is_err() {
            return None;
        }
        reply_rx.await.ok().flatten().map(Origin::new)
    }
}

/// Reload certificates from `dir` at runtime, e.g. in response to SIGHUP.
/// Returns the new directory for the caller to swap into a fresh
/// [`Authenticator`]; the old authenticator's background thread is left
/// running until its sender is dropped.
pub fn reload(dir: &PathBuf) -> Result<CertificateDirectory> {
    CertificateDirectory::load(dir)
}
