//! Multi-frame message envelope.
//!
//! Real dealer/router sockets deliver a message as an ordered sequence of
//! frames with an implicit origin identity prepended by the socket itself.
//! Over a plain TCP stream there is no such built-in framing, so each
//! envelope carries its own frame count and per-frame length, and is then
//! wrapped by [`tokio_util::codec::LengthDelimitedCodec`] for the outer
//! stream delimiting.
//!
//! Wire layout of one envelope's payload (before outer length-delimiting):
//!
//! ```text
//! u32 BE frame_count
//! repeated frame_count times:
//!     u32 BE frame_len
//!     frame_len bytes of frame data
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Maximum number of frames in one envelope. A generous ceiling; real
/// messages in this protocol carry at most a handful of frames.
pub const MAX_FRAMES: u32 = 64;

/// Maximum length of a single frame. Chunk payloads are bounded by the
/// server's configured chunk size well below this.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Encode `frames` into one envelope payload, ready to be handed to the
/// outer length-delimited codec.
pub fn encode_frames(frames: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>());
    buf.put_u32(frames.len() as u32);
    for frame in frames {
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);
    }
    buf.freeze()
}

/// Decode one envelope payload (as delivered by the outer length-delimited
/// codec) back into its constituent frames.
pub fn decode_frames(mut payload: Bytes) -> Result<Vec<Bytes>> {
    if payload.len() < 4 {
        return Err(TransportError::MalformedEnvelope(
            "envelope shorter than frame-count header".into(),
        ));
    }
    let frame_count = payload.get_u32();
    if frame_count > MAX_FRAMES {
        return Err(TransportError::MalformedEnvelope(format!(
            "frame count {frame_count} exceeds maximum {MAX_FRAMES}"
        )));
    }

    let mut frames = Vec::with_capacity(frame_count as usize);
    for _ in 0..frame_count {
        if payload.len() < 4 {
            return Err(TransportError::MalformedEnvelope(
                "truncated frame length".into(),
            ));
        }
        let len = payload.get_u32();
        if len > MAX_FRAME_LEN {
            return Err(TransportError::MalformedEnvelope(format!(
                "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
            )));
        }
        if (payload.len() as u32) < len {
            return Err(TransportError::MalformedEnvelope(
                "truncated frame body".into(),
            ));
        }
        frames.push(payload.copy_to_bytes(len as usize));
    }

    if !payload.is_empty() {
        return Err(TransportError::MalformedEnvelope(
            "trailing bytes after last frame".into(),
        ));
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_multiple_frames() {
        let frames = vec![
            Bytes::from_static(b"add-upload-request"),
            Bytes::from_static(b"sample.raw"),
            Bytes::from_static(b"{}"),
        ];
        let encoded = encode_frames(&frames);
        let decoded = decode_frames(encoded).unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn round_trips_zero_frames() {
        let encoded = encode_frames(&[]);
        assert_eq!(decode_frames(encoded).unwrap(), Vec::<Bytes>::new());
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(decode_frames(Bytes::from_static(b"\x00")).is_err());
    }

    #[test]
    fn rejects_oversized_frame_count() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAMES + 1);
        assert!(decode_frames(buf.freeze()).is_err());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u8(0xFF);
        assert!(decode_frames(buf.freeze()).is_err());
    }
}
