//! Frame codec.
//!
//! Every message on an authenticated connection is a single tagged frame:
//!
//! ```text
//! +----------+----------+----------+
//! |   Tag    |  Length  | Checksum |
//! | 1 byte   | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+
//! |            Payload             |
//! |         (Length bytes)         |
//! +--------------------------------+
//! ```
//!
//! - Tag: control tag (0x01-0x05) or a registered application tag
//! - Length: payload length in bytes (big-endian)
//! - Checksum: first 4 bytes of Blake2b-256(payload)
//!
//! The codec owns the tag registry: a frame with an unknown tag, or a
//! length above the tag's limit, fails decoding and terminates the
//! connection.

use std::collections::HashMap;

use blake2::{Blake2b, Digest};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use typenum::U32;

use crate::error::{PoolError, PoolResult};

/// Header size: tag (1) + length (4) + checksum (4).
const HEADER_SIZE: usize = 9;

/// A single tagged frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message tag.
    pub tag: u8,
    /// Raw payload.
    pub payload: Bytes,
}

impl Frame {
    /// Wire size of this frame including the header.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Codec for tagged frames with per-tag length limits.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    limits: HashMap<u8, usize>,
}

impl FrameCodec {
    /// Create a codec accepting exactly the tags in `limits`.
    pub(crate) fn new(limits: HashMap<u8, usize>) -> Self {
        Self { limits }
    }

    fn checksum(payload: &[u8]) -> [u8; 4] {
        let hash = Blake2b::<U32>::digest(payload);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&hash[0..4]);
        checksum
    }

    fn limit_for(&self, tag: u8) -> PoolResult<usize> {
        self.limits
            .get(&tag)
            .copied()
            .ok_or_else(|| PoolError::DecodingError(format!("unknown tag 0x{:02x}", tag)))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = PoolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let tag = src[0];
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        let checksum: [u8; 4] = [src[5], src[6], src[7], src[8]];

        let limit = self.limit_for(tag)?;
        if length > limit {
            return Err(PoolError::DecodingError(format!(
                "frame of {} bytes exceeds limit {} for tag 0x{:02x}",
                length, limit, tag
            )));
        }

        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        if Self::checksum(&payload) != checksum {
            return Err(PoolError::DecodingError("checksum mismatch".to_string()));
        }

        Ok(Some(Frame { tag, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PoolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let limit = self.limit_for(item.tag)?;
        if item.payload.len() > limit {
            return Err(PoolError::DecodingError(format!(
                "frame of {} bytes exceeds limit {} for tag 0x{:02x}",
                item.payload.len(),
                limit,
                item.tag
            )));
        }

        let checksum = Self::checksum(&item.payload);
        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_u8(item.tag);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&checksum);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// Encode and write one frame, chunking writes at `chunk_size` bytes.
///
/// Returns the number of bytes written.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    io: &mut W,
    codec: &mut FrameCodec,
    frame: Frame,
    chunk_size: usize,
) -> PoolResult<usize> {
    let mut buf = BytesMut::new();
    codec.encode(frame, &mut buf)?;
    let total = buf.len();
    for chunk in buf.chunks(chunk_size) {
        io.write_all(chunk).await?;
    }
    io.flush().await?;
    Ok(total)
}

/// Write pre-framed bytes, chunking writes at `chunk_size` bytes.
pub(crate) async fn write_raw<W: AsyncWrite + Unpin>(
    io: &mut W,
    bytes: &[u8],
    chunk_size: usize,
) -> PoolResult<usize> {
    for chunk in bytes.chunks(chunk_size) {
        io.write_all(chunk).await?;
    }
    io.flush().await?;
    Ok(bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        let mut limits = HashMap::new();
        limits.insert(0x10, 64);
        FrameCodec::new(limits)
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut c = codec();
        let frame = Frame {
            tag: 0x10,
            payload: Bytes::from_static(b"hello"),
        };

        let mut buf = BytesMut::new();
        c.encode(frame.clone(), &mut buf).unwrap();

        let decoded = c.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_input_needs_more() {
        let mut c = codec();
        let mut buf = BytesMut::new();
        c.encode(
            Frame {
                tag: 0x10,
                payload: Bytes::from_static(b"partial"),
            },
            &mut buf,
        )
        .unwrap();

        let mut cut = buf.split_to(buf.len() - 2);
        assert!(c.decode(&mut cut).unwrap().is_none());
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut c = codec();
        let mut buf = BytesMut::new();
        buf.put_u8(0x42);
        buf.put_u32(0);
        buf.put_slice(&FrameCodec::checksum(b""));

        let err = c.decode(&mut buf).unwrap_err();
        assert!(matches!(err, PoolError::DecodingError(_)));
    }

    #[test]
    fn test_over_length_frame_is_rejected() {
        let mut c = codec();
        let mut buf = BytesMut::new();
        buf.put_u8(0x10);
        buf.put_u32(65); // limit is 64
        buf.put_slice(&[0u8; 4]);

        let err = c.decode(&mut buf).unwrap_err();
        assert!(matches!(err, PoolError::DecodingError(_)));
    }

    #[test]
    fn test_checksum_mismatch_is_rejected() {
        let mut c = codec();
        let mut buf = BytesMut::new();
        c.encode(
            Frame {
                tag: 0x10,
                payload: Bytes::from_static(b"payload"),
            },
            &mut buf,
        )
        .unwrap();
        // Corrupt one payload byte.
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let err = c.decode(&mut buf).unwrap_err();
        assert!(matches!(err, PoolError::DecodingError(_)));
    }

    #[tokio::test]
    async fn test_chunked_write_frame() {
        use tokio::io::AsyncReadExt;

        let mut c = codec();
        let frame = Frame {
            tag: 0x10,
            payload: Bytes::from(vec![7u8; 40]),
        };

        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let written = write_frame(&mut tx, &mut c.clone(), frame.clone(), 8)
            .await
            .unwrap();
        assert_eq!(written, frame.wire_len());
        drop(tx);

        let mut out = Vec::new();
        rx.read_to_end(&mut out).await.unwrap();
        let mut buf = BytesMut::from(&out[..]);
        let decoded = c.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }
}
