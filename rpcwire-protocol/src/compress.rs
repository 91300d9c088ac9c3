//! bzip2 message compression.
//!
//! A compressed message keeps its 14-byte header in clear (status byte set
//! to [`CompressionStatus::Compressed`]) followed by:
//!
//! ```text
//! +---------------------------+----------------------+
//! | uncompressed size: i32    | bzip2(body)          |
//! | (whole message, header in)|                      |
//! +---------------------------+----------------------+
//! ```

use crate::error::ProtocolError;
#[cfg(feature = "bzip2")]
use crate::frame::{patch_size, HEADER_SIZE};
use crate::frame::{CompressionStatus, COMPRESSION_OFFSET};
use bytes::{Bytes, BytesMut};

/// Messages smaller than this are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 100;

/// Compresses a complete, size-patched message.
///
/// Small messages, and messages that bzip2 would not shrink, are returned
/// uncompressed with status [`CompressionStatus::Supported`] so that the
/// peer still knows a compressed reply is welcome.
#[cfg(feature = "bzip2")]
pub fn compress_message(mut message: BytesMut) -> Result<BytesMut, ProtocolError> {
    use bytes::BufMut;
    use std::io::Write;

    if message.len() < COMPRESSION_THRESHOLD {
        message[COMPRESSION_OFFSET] = CompressionStatus::Supported as u8;
        return Ok(message);
    }

    let mut encoder = bzip2::write::BzEncoder::new(
        Vec::with_capacity(message.len() / 2),
        bzip2::Compression::fast(),
    );
    encoder
        .write_all(&message[HEADER_SIZE..])
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;

    if HEADER_SIZE + 4 + compressed.len() >= message.len() {
        message[COMPRESSION_OFFSET] = CompressionStatus::Supported as u8;
        return Ok(message);
    }

    let mut out = BytesMut::with_capacity(HEADER_SIZE + 4 + compressed.len());
    out.put_slice(&message[..HEADER_SIZE]);
    out[COMPRESSION_OFFSET] = CompressionStatus::Compressed as u8;
    out.put_i32_le(message.len() as i32);
    out.put_slice(&compressed);
    patch_size(&mut out);
    Ok(out)
}

/// Without bzip2 support messages always go out uncompressed.
#[cfg(not(feature = "bzip2"))]
pub fn compress_message(mut message: BytesMut) -> Result<BytesMut, ProtocolError> {
    message[COMPRESSION_OFFSET] = CompressionStatus::NotCompressed as u8;
    Ok(message)
}

/// Decompresses the body of a message received with status
/// [`CompressionStatus::Compressed`]. `body` is everything after the header.
#[cfg(feature = "bzip2")]
pub fn decompress_body(body: Bytes, max_size: usize) -> Result<Bytes, ProtocolError> {
    use std::io::Read;

    if body.len() < 4 {
        return Err(ProtocolError::Compression(
            "compressed body too short".to_string(),
        ));
    }
    let uncompressed = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    if uncompressed < HEADER_SIZE as i32 {
        return Err(ProtocolError::Compression(format!(
            "invalid uncompressed size {uncompressed}"
        )));
    }
    let uncompressed = uncompressed as usize;
    if uncompressed > max_size {
        return Err(ProtocolError::MessageTooLarge {
            size: uncompressed,
            max: max_size,
        });
    }

    let expected = uncompressed - HEADER_SIZE;
    let mut out = Vec::with_capacity(expected);
    bzip2::read::BzDecoder::new(&body[4..])
        .take(expected as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;

    if out.len() != expected {
        return Err(ProtocolError::Compression(format!(
            "decompressed {} bytes, expected {}",
            out.len(),
            expected
        )));
    }
    Ok(Bytes::from(out))
}

#[cfg(not(feature = "bzip2"))]
pub fn decompress_body(_body: Bytes, _max_size: usize) -> Result<Bytes, ProtocolError> {
    Err(ProtocolError::CompressionNotSupported)
}

#[cfg(all(test, feature = "bzip2"))]
mod tests {
    use super::*;
    use crate::frame::{Frame, MessageType};
    use crate::DEFAULT_MAX_MESSAGE_SIZE;

    fn compressible_body() -> Bytes {
        Bytes::from("hello compression ".repeat(64))
    }

    #[test]
    fn test_compressed_roundtrip() {
        let frame = Frame::new(MessageType::Request, compressible_body());
        let mut buf = frame.encode(true).unwrap();
        assert_eq!(buf[COMPRESSION_OFFSET], CompressionStatus::Compressed as u8);
        assert!(buf.len() < HEADER_SIZE + compressible_body().len());

        let decoded = Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.header.compression, CompressionStatus::Compressed);
        assert_eq!(decoded.body, compressible_body());
    }

    #[test]
    fn test_small_message_marked_supported() {
        let frame = Frame::new(MessageType::Request, Bytes::from_static(b"tiny"));
        let buf = frame.encode(true).unwrap();
        assert_eq!(buf[COMPRESSION_OFFSET], CompressionStatus::Supported as u8);
        assert_eq!(buf.len(), HEADER_SIZE + 4);
    }

    #[test]
    fn test_incompressible_message_sent_plain() {
        // Pseudo-random bytes do not shrink.
        let mut state = 0x2545_f491_u32;
        let body: Vec<u8> = (0..200)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        let frame = Frame::new(MessageType::Reply, Bytes::from(body.clone()));
        let buf = frame.encode(true).unwrap();
        assert_eq!(buf[COMPRESSION_OFFSET], CompressionStatus::Supported as u8);
        assert_eq!(&buf[HEADER_SIZE..], &body[..]);
    }

    #[test]
    fn test_corrupt_stream_is_compression_error() {
        let frame = Frame::new(MessageType::Request, compressible_body());
        let mut buf = frame.encode(true).unwrap();
        let last = buf.len() - 5;
        buf[last] ^= 0xFF;
        buf[HEADER_SIZE + 10] ^= 0xFF;
        let err = Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap_err();
        assert!(err.is_compression(), "{err}");
    }

    #[test]
    fn test_uncompressed_size_limit() {
        let frame = Frame::new(MessageType::Request, compressible_body());
        let mut buf = frame.encode(true).unwrap();
        let err = Frame::decode(&mut buf, 200).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }
}
