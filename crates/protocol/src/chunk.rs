//! Binary transfer chunk framing.
//!
//! `[transfer_id: u32 LE][raw bytes...]`. There is no length prefix; the
//! WebSocket message boundary delimits the chunk.

use bytes::{BufMut, Bytes, BytesMut};

pub const CHUNK_HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("binary frame too short: {len} bytes, need at least {CHUNK_HEADER_LEN}")]
    TooShort { len: usize },
}

/// A decoded binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryChunk {
    pub transfer_id: u32,
    pub data: Bytes,
}

pub fn encode_chunk(transfer_id: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + data.len());
    buf.put_u32_le(transfer_id);
    buf.put_slice(data);
    buf.freeze()
}

/// Split a binary frame into its transfer id and payload without copying.
pub fn decode_chunk(mut frame: Bytes) -> Result<BinaryChunk, ChunkError> {
    if frame.len() < CHUNK_HEADER_LEN {
        return Err(ChunkError::TooShort { len: frame.len() });
    }
    let header = frame.split_to(CHUNK_HEADER_LEN);
    let transfer_id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    Ok(BinaryChunk {
        transfer_id,
        data: frame,
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_little_endian() {
        let frame = encode_chunk(7, b"abc");
        assert_eq!(&frame[..4], &[7, 0, 0, 0]);
        assert_eq!(&frame[4..], b"abc");

        let frame = encode_chunk(0x0102_0304, b"");
        assert_eq!(&frame[..], &[4, 3, 2, 1]);
    }

    #[test]
    fn decode_splits_id_from_payload() {
        let chunk = decode_chunk(Bytes::from_static(&[9, 1, 0, 0, 0xde, 0xad])).unwrap();
        assert_eq!(chunk.transfer_id, 265);
        assert_eq!(&chunk.data[..], &[0xde, 0xad]);
    }

    #[test]
    fn empty_payload_is_allowed() {
        let chunk = decode_chunk(encode_chunk(3, b"")).unwrap();
        assert_eq!(chunk.transfer_id, 3);
        assert!(chunk.data.is_empty());
    }

    #[test]
    fn short_frames_are_rejected() {
        assert_eq!(
            decode_chunk(Bytes::from_static(&[1, 2])),
            Err(ChunkError::TooShort { len: 2 })
        );
    }
}
