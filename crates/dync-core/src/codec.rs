//! Wire messages exchanged between client and server, and their framing
//! into/out of [`dync_transport`]'s frame lists.
//!
//! Every message is one `command` frame (an ASCII tag) followed by a
//! command-specific sequence of frames. Integers are fixed-width
//! big-endian; metadata is UTF-8 JSON. This mirrors the original
//! implementation's `messages.py` one-for-one, including which integer
//! width each field uses (`seek` is 8 bytes, everything else is 4).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::{Error, Result};

/// A message sent from client to server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientToServer {
    /// Begin a new upload: a destination file name plus routing metadata.
    PostFile {
        /// Reserved for future use; always `0` today.
        flags: u32,
        /// The name the client wants to give the uploaded file.
        name: String,
        /// Arbitrary JSON metadata consulted during destination resolution.
        meta: Value,
    },
    /// One chunk of file data.
    PostChunk {
        /// Whether this is the final chunk of the upload.
        is_last: bool,
        /// The byte offset this chunk starts at.
        seek: u64,
        /// The chunk's payload. Empty for a final, zero-length upload.
        data: Bytes,
        /// SHA-256 digest of the whole upload, present only when `is_last`.
        checksum: Option<[u8; 32]>,
    },
    /// Ask the server to report the current seek position and credit.
    QueryStatus,
    /// The client is reporting an error and abandoning the upload.
    Error {
        /// Numeric error code.
        code: u32,
        /// Human-readable description.
        msg: String,
    },
}

/// A message sent from server to client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerToClient {
    /// The upload was accepted; gives the client its starting credit and
    /// the chunk size and credit ceiling it must respect.
    UploadApproved {
        /// Initial credit granted to the client.
        credit: u32,
        /// Chunk size the client must use for subsequent `post-chunk`s.
        chunksize: u32,
        /// Maximum credit the client may ever hold.
        max_credit: u32,
    },
    /// The upload completed and was landed at its destination.
    UploadFinished {
        /// Server-assigned identifier for the completed upload.
        upload_id: String,
    },
    /// Additional credit offered outside the normal per-chunk grant.
    TransferCredit {
        /// Amount of credit transferred.
        amount: u32,
    },
    /// Answers a `query-status` with the server's authoritative seek
    /// position and the client's current credit.
    StatusReport {
        /// Bytes accepted so far.
        seek: u64,
        /// Current credit balance.
        credit: u32,
    },
    /// The server rejected the upload or encountered an internal failure.
    Error {
        /// Numeric error code.
        code: u32,
        /// Human-readable description.
        msg: String,
    },
}

fn require_frames(frames: &[Bytes], n: usize) -> Result<()> {
    if frames.len() < n {
        return Err(Error::InvalidMessage(format!(
            "expected at least {n} frames, got {}",
            frames.len()
        )));
    }
    Ok(())
}

fn decode_u32(frame: &Bytes) -> Result<u32> {
    if frame.len() != 4 {
        return Err(Error::InvalidMessage(format!(
            "expected 4-byte integer frame, got {} bytes",
            frame.len()
        )));
    }
    Ok((&frame[..]).get_u32())
}

fn decode_u64(frame: &Bytes) -> Result<u64> {
    if frame.len() != 8 {
        return Err(Error::InvalidMessage(format!(
            "expected 8-byte integer frame, got {} bytes",
            frame.len()
        )));
    }
    Ok((&frame[..]).get_u64())
}

fn decode_utf8(frame: &Bytes) -> Result<String> {
    String::from_utf8(frame.to_vec())
        .map_err(|e| Error::InvalidMessage(format!("invalid UTF-8: {e}")))
}

fn u32_frame(v: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(v);
    buf.freeze()
}

fn u64_frame(v: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64(v);
    buf.freeze()
}

impl ClientToServer {
    /// Parse a decoded frame list (command frame included) into a message.
    pub fn decode(frames: &[Bytes]) -> Result<Self> {
        require_frames(frames, 1)?;
        match &frames[0][..] {
            b"post-file" => {
                require_frames(frames, 4)?;
                let flags = decode_u32(&frames[1])?;
                let name = decode_utf8(&frames[2])?;
                let meta: Value = serde_json::from_slice(&frames[3])
                    .map_err(|e| Error::InvalidMessage(format!("invalid meta JSON: {e}")))?;
                Ok(ClientToServer::PostFile { flags, name, meta })
            }
            b"post-chunk" => {
                require_frames(frames, 3)?;
                let flags = decode_u32(&frames[1])?;
                let is_last = flags == 1;
                let seek = decode_u64(&frames[2])?;
                require_frames(frames, 4)?;
                let data = frames[3].clone();
                let checksum = if is_last {
                    require_frames(frames, 5)?;
                    if frames[4].len() != 32 {
                        return Err(Error::InvalidMessage(
                            "checksum frame must be 32 bytes".into(),
                        ));
                    }
                    let mut digest = [0u8; 32];
                    digest.copy_from_slice(&frames[4]);
                    Some(digest)
                } else {
                    None
                };
                Ok(ClientToServer::PostChunk {
                    is_last,
                    seek,
                    data,
                    checksum,
                })
            }
            b"query-status" => Ok(ClientToServer::QueryStatus),
            b"error" => {
                require_frames(frames, 3)?;
                let code = decode_u32(&frames[1])?;
                let msg = decode_utf8(&frames[2])?;
                Ok(ClientToServer::Error { code, msg })
            }
            other => Err(Error::InvalidMessage(format!(
                "unknown command: {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Encode into a frame list suitable for [`dync_transport::router::Router::send_to`].
    #[must_use]
    pub fn encode(&self) -> Vec<Bytes> {
        match self {
            ClientToServer::PostFile { flags, name, meta } => vec![
                Bytes::from_static(b"post-file"),
                u32_frame(*flags),
                Bytes::from(name.clone().into_bytes()),
                Bytes::from(serde_json::to_vec(meta).expect("meta is always valid JSON")),
            ],
            ClientToServer::PostChunk {
                is_last,
                seek,
                data,
                checksum,
            } => {
                let flags = if *is_last { 1 } else { 0 };
                let mut frames = vec![
                    Bytes::from_static(b"post-chunk"),
                    u32_frame(flags),
                    u64_frame(*seek),
                    data.clone(),
                ];
                if let Some(checksum) = checksum {
                    frames.push(Bytes::copy_from_slice(checksum));
                }
                frames
            }
            ClientToServer::QueryStatus => vec![Bytes::from_static(b"query-status")],
            ClientToServer::Error { code, msg } => vec![
                Bytes::from_static(b"error"),
                u32_frame(*code),
                Bytes::from(msg.clone().into_bytes()),
            ],
        }
    }
}

impl ServerToClient {
    /// Parse a decoded frame list (command frame included) into a message.
    pub fn decode(frames: &[Bytes]) -> Result<Self> {
        require_frames(frames, 1)?;
        match &frames[0][..] {
            b"upload-approved" => {
                require_frames(frames, 4)?;
                Ok(ServerToClient::UploadApproved {
                    credit: decode_u32(&frames[1])?,
                    chunksize: decode_u32(&frames[2])?,
                    max_credit: decode_u32(&frames[3])?,
                })
            }
            b"upload-finished" => {
                require_frames(frames, 2)?;
                Ok(ServerToClient::UploadFinished {
                    upload_id: decode_utf8(&frames[1])?,
                })
            }
            b"transfer-credit" => {
                require_frames(frames, 2)?;
                Ok(ServerToClient::TransferCredit {
                    amount: decode_u32(&frames[1])?,
                })
            }
            b"status-report" => {
                require_frames(frames, 3)?;
                Ok(ServerToClient::StatusReport {
                    seek: decode_u64(&frames[1])?,
                    credit: decode_u32(&frames[2])?,
                })
            }
            b"error" => {
                require_frames(frames, 3)?;
                Ok(ServerToClient::Error {
                    code: decode_u32(&frames[1])?,
                    msg: decode_utf8(&frames[2])?,
                })
            }
            other => Err(Error::InvalidMessage(format!(
                "unknown command: {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Encode into a frame list suitable for [`dync_transport::router::Router::send_to`].
    #[must_use]
    pub fn encode(&self) -> Vec<Bytes> {
        match self {
            ServerToClient::UploadApproved {
                credit,
                chunksize,
                max_credit,
            } => vec![
                Bytes::from_static(b"upload-approved"),
                u32_frame(*credit),
                u32_frame(*chunksize),
                u32_frame(*max_credit),
            ],
            ServerToClient::UploadFinished { upload_id } => vec![
                Bytes::from_static(b"upload-finished"),
                Bytes::from(upload_id.clone().into_bytes()),
            ],
            ServerToClient::TransferCredit { amount } => {
                vec![Bytes::from_static(b"transfer-credit"), u32_frame(*amount)]
            }
            ServerToClient::StatusReport { seek, credit } => vec![
                Bytes::from_static(b"status-report"),
                u64_frame(*seek),
                u32_frame(*credit),
            ],
            ServerToClient::Error { code, msg } => vec![
                Bytes::from_static(b"error"),
                u32_frame(*code),
                Bytes::from(msg.clone().into_bytes()),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn post_file_round_trips() {
        let msg = ClientToServer::PostFile {
            flags: 0,
            name: "sample.raw".into(),
            meta: json!({"passthrough": "lab_a"}),
        };
        let frames = msg.encode();
        assert_eq!(ClientToServer::decode(&frames).unwrap(), msg);
    }

    #[test]
    fn post_chunk_without_checksum_round_trips() {
        let msg = ClientToServer::PostChunk {
            is_last: false,
            seek: 128,
            data: Bytes::from_static(b"abc"),
            checksum: None,
        };
        let frames = msg.encode();
        assert_eq!(ClientToServer::decode(&frames).unwrap(), msg);
    }

    #[test]
    fn post_chunk_last_requires_checksum_frame() {
        let msg = ClientToServer::PostChunk {
            is_last: true,
            seek: 0,
            data: Bytes::new(),
            checksum: Some([7u8; 32]),
        };
        let frames = msg.encode();
        assert_eq!(frames.len(), 5);
        assert_eq!(ClientToServer::decode(&frames).unwrap(), msg);
    }

    #[test]
    fn upload_approved_round_trips() {
        let msg = ServerToClient::UploadApproved {
            credit: 200,
            chunksize: 120 * 1024,
            max_credit: 200,
        };
        let frames = msg.encode();
        assert_eq!(ServerToClient::decode(&frames).unwrap(), msg);
    }

    #[test]
    fn status_report_round_trips() {
        let msg = ServerToClient::StatusReport {
            seek: 4096,
            credit: 50,
        };
        let frames = msg.encode();
        assert_eq!(ServerToClient::decode(&frames).unwrap(), msg);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let frames = vec![Bytes::from_static(b"not-a-real-command")];
        assert!(ClientToServer::decode(&frames).is_err());
    }
}
