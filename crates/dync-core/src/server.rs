//! The server's single-threaded event loop.
//!
//! Everything here runs on one Tokio task: there is exactly one
//! `.recv().await` per iteration, matching the original implementation's
//! single-threaded `Server.serve` loop. Concurrency comes from the router's
//! per-connection accept tasks feeding this loop through one channel, not
//! from this loop itself running in parallel.

use std::time::{Duration, Instant};

/// Upper bound on how long one iteration of [`Server::serve`] blocks waiting
/// for the next event. Keeps timeout sweeps and credit distribution running
/// even while a connection sits idle and sends nothing, mirroring the bounded
/// poll timeout of the original implementation's event loop.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

use dync_storage::Storage;
use dync_transport::{ConnId, Router, RouterEvent};
use indexmap::IndexMap;
use tokio::sync::mpsc;

use crate::codec::{ClientToServer, ServerToClient};
use crate::flow::{DebtTracker, FlowConfig};
use crate::session::UploadSession;

/// Runs the upload coordination loop against one [`Storage`] and one
/// [`Router`].
pub struct Server {
    router: Router,
    storage: Storage,
    sessions: IndexMap<ConnId, UploadSession>,
    debt: DebtTracker,
    flow: FlowConfig,
    events: mpsc::Receiver<RouterEvent>,
    last_timeout_check: Instant,
}

impl Server {
    /// Build a server that will read events from `events` and dispatch
    /// replies through `router`.
    #[must_use]
    pub fn new(
        router: Router,
        storage: Storage,
        flow: FlowConfig,
        events: mpsc::Receiver<RouterEvent>,
    ) -> Self {
        Server {
            router,
            storage,
            sessions: IndexMap::new(),
            debt: DebtTracker::default(),
            flow,
            events,
            last_timeout_check: Instant::now(),
        }
    }

    /// Number of uploads currently in flight.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Run until the event channel closes (the router has no more senders,
    /// which in practice means the process is shutting down).
    pub async fn serve(&mut self) {
        loop {
            if self.debt.should_distribute(&self.flow) {
                self.distribute_credit();
            }
            if self.last_timeout_check.elapsed() > Duration::from_secs(self.flow.timeout_secs) {
                self.check_timeouts().await;
                self.last_timeout_check = Instant::now();
                tracing::info!(
                    active = self.sessions.len(),
                    debt = self.debt.debt(),
                    "status"
                );
            }

            match tokio::time::timeout(POLL_INTERVAL, self.events.recv()).await {
                Ok(Some(RouterEvent::Message(envelope))) => {
                    self.handle_envelope(envelope).await;
                }
                Ok(Some(RouterEvent::Closed(disconnected))) => {
                    self.handle_disconnect(disconnected.conn_id).await;
                }
                Ok(None) => {
                    tracing::info!("event channel closed, shutting down");
                    self.shutdown().await;
                    return;
                }
                Err(_elapsed) => {
                    // No event within the poll interval; loop back around so
                    // the timeout/credit checks above run again.
                }
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: dync_transport::Envelope) {
        let conn_id = envelope.conn_id.clone();
        let origin = envelope.origin.clone();

        let msg = match ClientToServer::decode(&envelope.frames) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "invalid message");
                self.send_error(&conn_id, 400, "Invalid message");
                return;
            }
        };

        if let ClientToServer::PostFile { flags: _, name, meta } = msg {
            self.add_upload(conn_id, origin, name, meta).await;
            return;
        }

        self.dispatch_to_session(conn_id, origin, msg).await;
    }

    async fn add_upload(
        &mut self,
        conn_id: ConnId,
        origin: dync_transport::Origin,
        name: String,
        meta: serde_json::Value,
    ) {
        tracing::info!(%conn_id, %origin, "creating new upload");

        if self.sessions.contains_key(&conn_id) {
            self.send_error(&conn_id, 400, "Connection id not unique");
            return;
        }

        let init_credit = self.debt.initial_credit(&self.flow);

        let storage_id = match self.storage.add_file(origin.as_str(), &name, &meta).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(%conn_id, error = %e, "failed to create upload");
                self.send_error(&conn_id, e.code(), &format!("Failed to create upload: {e}"));
                return;
            }
        };

        let session = UploadSession::new(conn_id.clone(), origin, storage_id, init_credit);
        self.debt.add(init_credit);

        let approved = ServerToClient::UploadApproved {
            credit: init_credit,
            chunksize: self.flow.chunk_size,
            max_credit: self.flow.max_credit,
        };
        self.send(&conn_id, &approved);

        self.sessions.insert(conn_id, session);
        tracing::info!(active = self.sessions.len(), "upload created");
    }

    async fn dispatch_to_session(
        &mut self,
        conn_id: ConnId,
        origin: dync_transport::Origin,
        msg: ClientToServer,
    ) {
        let Some(session) = self.sessions.get_mut(&conn_id) else {
            tracing::debug!(%conn_id, %origin, "message for unknown connection");
            self.send_error(&conn_id, 400, "Unknown connection.");
            return;
        };

        if session.origin() != &origin {
            tracing::error!(%conn_id, %origin, "message origin does not match session origin");
            return;
        }

        let outcome = match msg {
            ClientToServer::PostChunk {
                is_last,
                seek,
                data,
                checksum,
            } => session
                .handle_post_chunk(is_last, seek, data, checksum, &mut self.storage)
                .await
                .unwrap_or_else(|e| crate::session::SessionOutcome {
                    finished: true,
                    returned_credit: session.credit(),
                    reply: Some(ServerToClient::Error {
                        code: e.code(),
                        msg: e.to_string(),
                    }),
                }),
            ClientToServer::Error { code, msg } => {
                tracing::warn!(%conn_id, code, %msg, "client reported error");
                session.handle_client_error(&mut self.storage).await
            }
            ClientToServer::QueryStatus => session
                .handle_query_status(&self.storage)
                .unwrap_or_default(),
            ClientToServer::PostFile { .. } => {
                tracing::error!(%conn_id, "unexpected post-file on existing connection");
                return;
            }
        };

        self.debt.subtract(outcome.returned_credit);
        if let Some(reply) = &outcome.reply {
            self.send(&conn_id, reply);
        }
        if outcome.finished {
            self.sessions.shift_remove(&conn_id);
            tracing::info!(active = self.sessions.len(), "upload finished");
        }
    }

    async fn handle_disconnect(&mut self, conn_id: ConnId) {
        if let Some(mut session) = self.sessions.shift_remove(&conn_id) {
            tracing::debug!(%conn_id, "connection closed with upload in flight, canceling");
            let (credit, _reply) = session.cancel(499, "Connection closed", &mut self.storage).await;
            self.debt.subtract(credit);
        }
    }

    fn distribute_credit(&mut self) {
        let Server {
            sessions,
            debt,
            flow,
            router,
            ..
        } = self;
        tracing::debug!(debt = debt.debt(), "distributing credit");
        for (conn_id, session) in sessions.iter_mut() {
            if debt.debt() >= flow.max_debt {
                break;
            }
            let headroom = debt.headroom(flow);
            let transferred = session.offer_credit(headroom, flow);
            if transferred > 0 {
                debt.add(transferred);
                let msg = ServerToClient::TransferCredit {
                    amount: transferred,
                };
                if let Err(e) = router.send_to(conn_id, &msg.encode()) {
                    tracing::debug!(%conn_id, error = %e, "failed to send transfer-credit");
                }
            }
        }
    }

    async fn check_timeouts(&mut self) {
        let timeout = Duration::from_secs(self.flow.timeout_secs);
        let stale: Vec<ConnId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.idle_for() > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for conn_id in stale {
            if let Some(mut session) = self.sessions.shift_remove(&conn_id) {
                let (credit, reply) = session
                    .cancel(408, "Connection timed out.", &mut self.storage)
                    .await;
                self.debt.subtract(credit);
                self.send(&conn_id, &reply);
            }
        }
    }

    /// Cancel every in-flight upload with a `503` and drain the session
    /// table. Called once when the event channel closes.
    pub async fn shutdown(&mut self) {
        let conn_ids: Vec<ConnId> = self.sessions.keys().cloned().collect();
        for conn_id in conn_ids {
            if let Some(mut session) = self.sessions.shift_remove(&conn_id) {
                let (credit, reply) = session
                    .cancel(503, "Server shutdown", &mut self.storage)
                    .await;
                self.debt.subtract(credit);
                self.send(&conn_id, &reply);
            }
        }
    }

    fn send(&self, conn_id: &ConnId, msg: &ServerToClient) {
        if let Err(e) = self.router.send_to(conn_id, &msg.encode()) {
            tracing::debug!(%conn_id, error = %e, "failed to send message");
        }
    }

    fn send_error(&self, conn_id: &ConnId, code: u32, msg: &str) {
        self.send(
            conn_id,
            &ServerToClient::Error {
                code,
                msg: msg.to_string(),
            },
        );
    }
}
