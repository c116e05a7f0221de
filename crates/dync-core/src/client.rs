//! Client-side upload session: a replay buffer over a local [`Read`] source
//! and the send/receive loop that drives one upload to completion.
//!
//! The replay buffer exists because the server may ask for a chunk the
//! client already sent (a `status-report` rewinding `seek`, for instance
//! after a retransmit). Rather than seeking the underlying reader — which
//! may not support it, e.g. stdin — recently read chunks are kept around in
//! a bounded queue and replayed from there.

use std::collections::VecDeque;
use std::io::Read;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use dync_transport::codec::{decode_frames, encode_frames};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::codec::{ClientToServer, ServerToClient};
use crate::error::{Error, Result};

/// A local file-like source paired with a bounded resend buffer, mirroring
/// the server's server-authoritative seek position on the client side.
pub struct UploadFile<R> {
    source: R,
    chunk_size: usize,
    hasher: Sha256,
    seek_read: u64,
    seek: u64,
    chunks: VecDeque<(u64, Bytes)>,
    max_queue: usize,
}

impl<R: Read> UploadFile<R> {
    /// Wrap `source`, reading in `chunk_size` pieces and keeping at most
    /// `max_queue` of them available for resend.
    #[must_use]
    pub fn new(source: R, max_queue: usize, chunk_size: usize) -> Self {
        UploadFile {
            source,
            chunk_size,
            hasher: Sha256::new(),
            seek_read: 0,
            seek: 0,
            chunks: VecDeque::with_capacity(max_queue.min(1024)),
            max_queue,
        }
    }

    /// Current send position.
    #[must_use]
    pub fn seek(&self) -> u64 {
        self.seek
    }

    /// Rewind (or fast-forward) to a position the server has already
    /// confirmed receiving. Must not move past data not yet read from the
    /// source.
    pub fn seek_to(&mut self, new_value: u64) {
        debug_assert!(new_value <= self.seek_read);
        self.seek = new_value;
    }

    /// SHA-256 digest of everything read so far. Only meaningful once the
    /// whole file has been read (`read` returned an empty chunk).
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        self.hasher.clone().finalize().into()
    }

    /// Read the next chunk to send. At the current write frontier this
    /// pulls fresh bytes from the source; behind it, this replays a
    /// previously buffered chunk. An empty return means end of file.
    pub fn read(&mut self) -> Result<Bytes> {
        if self.seek == self.seek_read {
            let mut buf = vec![0u8; self.chunk_size];
            let mut total = 0;
            while total < buf.len() {
                let n = self.source.read(&mut buf[total..])?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            buf.truncate(total);
            self.hasher.update(&buf);
            let data = Bytes::from(buf);
            if self.max_queue > 0 {
                if self.chunks.len() == self.max_queue {
                    self.chunks.pop_front();
                }
                self.chunks.push_back((self.seek_read, data.clone()));
            }
            self.seek_read += data.len() as u64;
            self.seek += data.len() as u64;
            Ok(data)
        } else {
            for (seek, data) in &self.chunks {
                if *seek == self.seek {
                    self.seek += data.len() as u64;
                    return Ok(data.clone());
                }
            }
            Err(Error::Internal(
                "server requested a chunk outside the local resend buffer".into(),
            ))
        }
    }
}

const RETRIES: usize = 120;
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Drives one upload from `post-file` through `upload-finished`.
pub struct ClientSession<R> {
    stream: Framed<TcpStream, LengthDelimitedCodec>,
    file: UploadFile<R>,
    credit: u32,
    progress: Option<Box<dyn FnMut(u64) + Send>>,
}

impl<R: Read> ClientSession<R> {
    /// Connect to `addr`, authenticate with `token`, and open an upload
    /// named `name` carrying `meta`. Blocks until the server answers with
    /// `upload-approved`.
    pub async fn connect(
        addr: SocketAddr,
        token: &str,
        name: String,
        meta: Value,
        source: R,
    ) -> Result<Self> {
        let tcp = TcpStream::connect(addr).await?;
        let mut stream = Framed::new(tcp, LengthDelimitedCodec::new());

        stream.send(Bytes::from(token.as_bytes().to_vec())).await?;

        let post_file = ClientToServer::PostFile {
            flags: 0,
            name,
            meta,
        };
        stream.send(encode_frames(&post_file.encode())).await?;

        let reply = stream
            .next()
            .await
            .ok_or_else(|| Error::Internal("connection closed before upload-approved".into()))??;
        let frames = decode_frames(reply.freeze())?;
        let msg = ServerToClient::decode(&frames)?;

        let (credit, chunksize, max_credit) = match msg {
            ServerToClient::UploadApproved {
                credit,
                chunksize,
                max_credit,
            } => (credit, chunksize, max_credit),
            ServerToClient::Error { code, msg } => {
                return Err(Error::Internal(format!(
                    "server refused upload: {code} {msg}"
                )));
            }
            other => {
                return Err(Error::InvalidMessage(format!(
                    "expected upload-approved, got {other:?}"
                )));
            }
        };

        let file = UploadFile::new(source, max_credit as usize, chunksize as usize);
        Ok(ClientSession {
            stream,
            file,
            credit,
            progress: None,
        })
    }

    /// Install a callback invoked with the number of bytes sent in each
    /// chunk, for progress reporting.
    pub fn set_progress(&mut self, callback: impl FnMut(u64) + Send + 'static) {
        self.progress = Some(Box::new(callback));
    }

    /// Run the upload to completion, returning the server-assigned upload
    /// id.
    pub async fn run(&mut self) -> Result<String> {
        self.send_chunks().await?;
        loop {
            let (finished, upload_id) = self.recv_server_status().await?;
            if finished {
                return upload_id
                    .ok_or_else(|| Error::Internal("upload-finished without an id".into()));
            }
            self.send_chunks().await?;
        }
    }

    /// Tell the server this upload is being abandoned, e.g. because the
    /// local process caught an interrupt signal. Best-effort: the session
    /// is dropped either way once this returns.
    pub async fn abort(&mut self) -> Result<()> {
        self.send(&ClientToServer::Error {
            code: 400,
            msg: "Client shutting down".into(),
        })
        .await
    }

    async fn send_chunks(&mut self) -> Result<()> {
        let mut is_last = false;
        while self.credit > 0 && !is_last {
            is_last = self.send_chunk().await?;
            self.credit -= 1;
        }
        Ok(())
    }

    async fn send_chunk(&mut self) -> Result<bool> {
        let seek = self.file.seek();
        let data = self.file.read()?;
        if let Some(cb) = &mut self.progress {
            cb(data.len() as u64);
        }
        let is_last = data.is_empty();
        let checksum = is_last.then(|| self.file.digest());
        let msg = ClientToServer::PostChunk {
            is_last,
            seek,
            data,
            checksum,
        };
        self.send(&msg).await?;
        Ok(is_last)
    }

    async fn recv_server_status(&mut self) -> Result<(bool, Option<String>)> {
        for _ in 0..RETRIES {
            match tokio::time::timeout(RECV_TIMEOUT, self.stream.next()).await {
                Ok(Some(frame)) => {
                    let frame = frame?;
                    let frames = decode_frames(frame.freeze())?;
                    let msg = ServerToClient::decode(&frames)?;
                    return self.apply_server_msg(msg);
                }
                Ok(None) => {
                    return Err(Error::Internal("connection closed by server".into()));
                }
                Err(_elapsed) => {
                    tracing::debug!("no reply within timeout, sending status query");
                    self.send(&ClientToServer::QueryStatus).await?;
                }
            }
        }
        Err(Error::Timeout)
    }

    fn apply_server_msg(&mut self, msg: ServerToClient) -> Result<(bool, Option<String>)> {
        match msg {
            ServerToClient::Error { code, msg } => {
                Err(Error::Internal(format!("server reported error {code}: {msg}")))
            }
            ServerToClient::TransferCredit { amount } => {
                self.credit += amount;
                Ok((false, None))
            }
            ServerToClient::StatusReport { seek, credit } => {
                self.credit = credit;
                self.file.seek_to(seek);
                Ok((false, None))
            }
            ServerToClient::UploadFinished { upload_id } => Ok((true, Some(upload_id))),
            ServerToClient::UploadApproved { .. } => Err(Error::InvalidMessage(
                "unexpected upload-approved after the handshake".into(),
            )),
        }
    }

    async fn send(&mut self, msg: &ClientToServer) -> Result<()> {
        self.stream.send(encode_frames(&msg.encode())).await?;
        Ok(())
    }
}
