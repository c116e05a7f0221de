//! Per-upload state machine.
//!
//! One [`UploadSession`] exists for the lifetime of one `post-file` through
//! its terminal `upload-finished`/`error`/cancellation. Sessions never touch
//! the network directly; [`UploadSession::handle_msg`] and friends return a
//! [`SessionOutcome`] describing what, if anything, the caller (the server
//! event loop) should send back and how much credit to reconcile against
//! the server's aggregate debt.

use std::time::{Duration, Instant};

use dync_storage::Storage;
use dync_transport::{ConnId, Origin};
use uuid::Uuid;

use crate::codec::ServerToClient;
use crate::error::Result;
use crate::flow::FlowConfig;

/// Where an upload is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// `upload-approved` was sent; waiting for the first chunk.
    Approved,
    /// At least one non-final chunk has been accepted.
    Receiving,
    /// The final chunk arrived and landing is in progress.
    Finalizing,
    /// Landed successfully; `upload-finished` was sent.
    Finished,
    /// Landing failed (usually a checksum mismatch); an `error` was sent.
    Failed,
    /// Canceled by the client, a protocol violation, a timeout, or
    /// server shutdown.
    Canceled,
}

/// The result of feeding one message (or a timeout/shutdown) to a session.
#[derive(Debug, Default)]
pub struct SessionOutcome {
    /// Whether the session has reached a terminal state and should be
    /// removed from the server's session table.
    pub finished: bool,
    /// Credit to subtract from the server's aggregate debt.
    pub returned_credit: u32,
    /// A message to send back to the client, if any.
    pub reply: Option<ServerToClient>,
}

impl SessionOutcome {
    fn silent_drop() -> Self {
        SessionOutcome::default()
    }
}

/// One client's upload in progress.
pub struct UploadSession {
    id: String,
    conn_id: ConnId,
    origin: Origin,
    storage_id: Uuid,
    credit: u32,
    last_active: Instant,
    state: SessionState,
}

impl UploadSession {
    /// Start tracking a newly approved upload.
    #[must_use]
    pub fn new(conn_id: ConnId, origin: Origin, storage_id: Uuid, init_credit: u32) -> Self {
        UploadSession {
            id: Uuid::new_v4().simple().to_string(),
            conn_id,
            origin,
            storage_id,
            credit: init_credit,
            last_active: Instant::now(),
            state: SessionState::Approved,
        }
    }

    /// Server-assigned upload id, sent back in `upload-finished`.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The connection this session is bound to.
    #[must_use]
    pub fn conn_id(&self) -> &ConnId {
        &self.conn_id
    }

    /// The verified origin that opened this session.
    #[must_use]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Credit currently held by this session.
    #[must_use]
    pub fn credit(&self) -> u32 {
        self.credit
    }

    /// How long since this session last received a message.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// Handle an incoming chunk. Out-of-order chunks (wrong `seek`) are
    /// silently dropped, matching the resumable-upload contract: the
    /// client is expected to re-derive its position from a prior
    /// `status-report` rather than have the server error out.
    pub async fn handle_post_chunk(
        &mut self,
        is_last: bool,
        seek: u64,
        data: bytes::Bytes,
        checksum: Option<[u8; 32]>,
        storage: &mut Storage,
    ) -> Result<SessionOutcome> {
        self.last_active = Instant::now();

        let current = storage.bytes_written(self.storage_id)?;
        if seek != current {
            return Ok(SessionOutcome::silent_drop());
        }

        if is_last {
            self.state = SessionState::Finalizing;
            let returned_credit = self.credit;
            self.credit = 0;

            let checksum_hex = checksum.map(hex::encode).unwrap_or_default();
            match storage.finalize(self.storage_id, &checksum_hex).await {
                Ok(_landed) => {
                    self.state = SessionState::Finished;
                    Ok(SessionOutcome {
                        finished: true,
                        returned_credit,
                        reply: Some(ServerToClient::UploadFinished {
                            upload_id: self.id.clone(),
                        }),
                    })
                }
                Err(e) => {
                    self.state = SessionState::Failed;
                    Ok(SessionOutcome {
                        finished: true,
                        returned_credit,
                        reply: Some(ServerToClient::Error {
                            code: e.code(),
                            msg: e.to_string(),
                        }),
                    })
                }
            }
        } else {
            if self.credit == 0 {
                // A peer with no credit has no business sending a chunk;
                // drop it rather than underflow `credit` below zero.
                return Ok(SessionOutcome::silent_drop());
            }
            self.state = SessionState::Receiving;
            storage.write(self.storage_id, &data).await?;
            self.credit -= 1;
            Ok(SessionOutcome {
                finished: false,
                returned_credit: 1,
                reply: None,
            })
        }
    }

    /// The client reported an error and is abandoning the upload.
    pub async fn handle_client_error(&mut self, storage: &mut Storage) -> SessionOutcome {
        self.last_active = Instant::now();
        storage.abort(self.storage_id).await;
        self.state = SessionState::Canceled;
        let credit = self.credit;
        self.credit = 0;
        SessionOutcome {
            finished: true,
            returned_credit: credit,
            reply: None,
        }
    }

    /// Report the server's authoritative seek position and current credit.
    pub fn handle_query_status(&mut self, storage: &Storage) -> Result<SessionOutcome> {
        self.last_active = Instant::now();
        let seek = storage.bytes_written(self.storage_id)?;
        Ok(SessionOutcome {
            finished: false,
            returned_credit: 0,
            reply: Some(ServerToClient::StatusReport {
                seek,
                credit: self.credit,
            }),
        })
    }

    /// Offer up to `amount` additional credit, capped by `config.max_credit`.
    /// Returns `0` if the session already holds enough credit to not need
    /// more yet (at or above `transfer_threshold`).
    #[must_use]
    pub fn offer_credit(&mut self, amount: u32, config: &FlowConfig) -> u32 {
        if self.credit >= config.transfer_threshold {
            return 0;
        }
        let old = self.credit;
        self.credit = config.max_credit.min(self.credit + amount);
        self.credit - old
    }

    /// Cancel the session: abort its staged file and report `code`/`msg`
    /// to the client. Returns the credit that must be subtracted from the
    /// server's aggregate debt.
    pub async fn cancel(&mut self, code: u32, msg: &str, storage: &mut Storage) -> (u32, ServerToClient) {
        storage.abort(self.storage_id).await;
        self.state = SessionState::Canceled;
        let credit = self.credit;
        self.credit = 0;
        (credit, ServerToClient::Error {
            code,
            msg: msg.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dync_storage::{DropboxConfig, DropboxRule};
    use serde_json::json;
    use tempfile::tempdir;

    fn storage() -> (tempfile::TempDir, tempfile::TempDir, Storage) {
        let tmp = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let config = DropboxConfig {
            path: dest.path().to_path_buf(),
            manual: dest.path().to_path_buf(),
            dropboxes: vec![DropboxRule {
                regexp: ".*".to_string(),
                path: dest.path().to_path_buf(),
                origin: None,
                match_file: true,
                match_dir: false,
                requires_barcode: false,
            }],
        };
        let storage = Storage::new(tmp.path().to_path_buf(), config);
        (tmp, dest, storage)
    }

    #[tokio::test]
    async fn out_of_order_chunk_is_silently_dropped() {
        let (_tmp, _dest, mut storage) = storage();
        let id = storage.add_file("c", "f.raw", &json!({})).await.unwrap();
        let mut session = UploadSession::new(ConnId::from_bytes([0; 16]), Origin::new("c"), id, 200);

        let outcome = session
            .handle_post_chunk(false, 999, bytes::Bytes::from_static(b"x"), None, &mut storage)
            .await
            .unwrap();
        assert!(!outcome.finished);
        assert_eq!(outcome.returned_credit, 0);
        assert!(outcome.reply.is_none());
    }

    #[tokio::test]
    async fn offer_credit_respects_threshold_and_cap() {
        let (_tmp, _dest, mut storage) = storage();
        let id = storage.add_file("c", "f.raw", &json!({})).await.unwrap();
        let mut session = UploadSession::new(ConnId::from_bytes([1; 16]), Origin::new("c"), id, 50);
        let config = FlowConfig::default();

        let transfer = session.offer_credit(500, &config);
        assert_eq!(session.credit(), config.max_credit);
        assert_eq!(transfer, config.max_credit - 50);

        // Already above transfer_threshold: no further credit offered.
        let transfer_again = session.offer_credit(500, &config);
        assert_eq!(transfer_again, 0);
    }
}
