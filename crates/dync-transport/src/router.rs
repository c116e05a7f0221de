//! Router: accepts TCP connections, assigns each an opaque connection id,
//! and shuttles framed envelopes between the wire and the single-threaded
//! core event loop.
//!
//! This emulates the identity-bearing delivery of a ROUTER/DEALER socket
//! pair: every inbound envelope carries the [`ConnId`] of the connection it
//! arrived on, and the core loop addresses outbound envelopes back to that
//! same id. Unlike a real ROUTER socket, a dropped TCP connection has no
//! way to hand its identity to a reconnecting peer, so identity is only
//! stable for the lifetime of one connection.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::RngCore;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use futures_util::{SinkExt, StreamExt};

use crate::auth::Authenticator;
use crate::codec::{decode_frames, encode_frames};
use crate::error::{Result, TransportError};

/// Opaque per-connection identity, analogous to a ZeroMQ ROUTER socket's
/// peer identity frame. Sixteen random bytes, assigned on accept.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnId(Bytes);

impl ConnId {
    fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        ConnId(Bytes::copy_from_slice(&bytes))
    }

    /// Build a `ConnId` from raw bytes. Exposed for tests in downstream
    /// crates that need a stable id without going through an accept loop.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ConnId(Bytes::copy_from_slice(&bytes))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The verified identity of the peer on one connection, as established by
/// the [`Authenticator`] during accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin(String);

impl Origin {
    /// Wrap a raw origin string.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Origin(s.into())
    }

    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One inbound message, tagged with the connection it arrived on and the
/// verified origin of that connection.
#[derive(Debug)]
pub struct Envelope {
    /// Connection the envelope arrived on.
    pub conn_id: ConnId,
    /// Verified origin of that connection.
    pub origin: Origin,
    /// The message's frames, in order.
    pub frames: Vec<Bytes>,
}

/// Sent by the router to the core loop when a connection ends, so sessions
/// bound to it can be cleaned up.
#[derive(Debug)]
pub struct Disconnected {
    /// The connection that ended.
    pub conn_id: ConnId,
}

/// Events delivered from the router to the core event loop.
#[derive(Debug)]
pub enum RouterEvent {
    /// A full envelope was received on some connection.
    Message(Envelope),
    /// A connection ended, gracefully or otherwise.
    Closed(Disconnected),
}

type OutgoingSender = mpsc::UnboundedSender<Bytes>;

/// Accepts connections and dispatches [`RouterEvent`]s to the core loop.
/// Cloning a `Router` shares the same connection registry, so the core loop
/// can hold one clone to call [`Router::send_to`] while the accept loop
/// runs with another.
#[derive(Clone)]
pub struct Router {
    connections: Arc<Mutex<HashMap<ConnId, OutgoingSender>>>,
}

impl Router {
    /// Build an empty router. Call [`Router::serve`] to start accepting.
    #[must_use]
    pub fn new() -> Self {
        Router {
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bind `addr` and accept connections forever, dispatching events to
    /// `events`. Each accepted connection must present a valid bearer
    /// token as its first raw frame, verified through `auth`, before its
    /// first envelope is forwarded.
    pub async fn serve(
        &self,
        addr: SocketAddr,
        events: mpsc::Sender<RouterEvent>,
        auth: Arc<Authenticator>,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "router listening");
        self.serve_listener(listener, events, auth).await
    }

    /// Like [`Router::serve`], but against an already-bound listener. Lets a
    /// caller bind port `0` and read back the assigned port before handing
    /// the listener over, which `serve` itself has no way to report.
    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        events: mpsc::Sender<RouterEvent>,
        auth: Arc<Authenticator>,
    ) -> Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let conn_id = ConnId::random();
            tracing::debug!(%conn_id, %peer_addr, "accepted connection");

            let this = self.clone();
            let events = events.clone();
            let auth = Arc::clone(&auth);
            tokio::spawn(async move {
                if let Err(e) = this
                    .handle_connection(conn_id.clone(), peer_addr, stream, events.clone(), auth)
                    .await
                {
                    tracing::warn!(%conn_id, error = %e, "connection ended with error");
                }
                this.connections.lock().unwrap().remove(&conn_id);
                let _ = events.send(RouterEvent::Closed(Disconnected { conn_id })).await;
            });
        }
    }

    async fn handle_connection(
        &self,
        conn_id: ConnId,
        peer_addr: SocketAddr,
        stream: TcpStream,
        events: mpsc::Sender<RouterEvent>,
        auth: Arc<Authenticator>,
    ) -> Result<()> {
        let framed = Framed::new(stream, LengthDelimitedCodec::new());
        let (mut sink, mut stream) = framed.split();

        let token_frame = stream
            .next()
            .await
            .ok_or_else(|| TransportError::Unauthenticated)??;
        let token = String::from_utf8(token_frame.to_vec())
            .map_err(|_| TransportError::Unauthenticated)?;
        let origin = match auth.authenticate(token.trim()).await {
            Some(origin) => origin,
            None => {
                tracing::debug!(%conn_id, %peer_addr, "rejected unauthenticated connection");
                return Err(TransportError::Unauthenticated);
            }
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
        self.connections.lock().unwrap().insert(conn_id.clone(), out_tx);

        let writer_conn_id = conn_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(payload) = out_rx.recv().await {
                if let Err(e) = sink.send(payload).await {
                    tracing::warn!(conn_id = %writer_conn_id, error = %e, "write failed");
                    break;
                }
            }
        });

        while let Some(frame) = stream.next().await {
            let payload = frame?.freeze();
            let frames = decode_frames(payload)?;
            let envelope = Envelope {
                conn_id: conn_id.clone(),
                origin: origin.clone(),
                frames,
            };
            if events.send(RouterEvent::Message(envelope)).await.is_err() {
                break;
            }
        }

        writer.abort();
        Ok(())
    }

    /// Send an envelope's frames to a specific connection. A no-op (with a
    /// debug log) if the connection has already closed.
    pub fn send_to(&self, conn_id: &ConnId, frames: &[Bytes]) -> Result<()> {
        let connections = self.connections.lock().unwrap();
        match connections.get(conn_id) {
            Some(sender) => {
                let payload = encode_frames(frames);
                sender
                    .send(payload)
                    .map_err(|_| TransportError::UnknownConnection(conn_id.to_string()))
            }
            None => {
                tracing::debug!(%conn_id, "send_to: connection already closed");
                Ok(())
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
