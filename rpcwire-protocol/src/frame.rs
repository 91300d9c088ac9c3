//! Message header and frame format.
//!
//! Header layout (14 bytes, integers little-endian):
//!
//! ```text
//! +--------+-------+-------+-------+-------+------+-------------+--------+
//! | magic  | proto | proto | enc   | enc   | type | compression | size   |
//! | "IceP" | major | minor | major | minor |      | status      | i32    |
//! | 4 bytes| 1     | 1     | 1     | 1     | 1    | 1           | 4 bytes|
//! +--------+-------+-------+-------+-------+------+-------------+--------+
//! ```
//!
//! `size` covers the whole message, header included.

use crate::compress;
use crate::error::ProtocolError;
use crate::version::{EncodingVersion, ProtocolVersion, HEADER_ENCODING, PROTOCOL_1_0};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Magic bytes opening every message.
pub const MAGIC: [u8; 4] = *b"IceP";

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 14;

/// Offset of the message type byte.
pub const MESSAGE_TYPE_OFFSET: usize = 8;

/// Offset of the compression status byte.
pub const COMPRESSION_OFFSET: usize = 9;

/// Offset of the message size.
pub const SIZE_OFFSET: usize = 10;

/// Protocol message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    RequestBatch = 1,
    Reply = 2,
    ValidateConnection = 3,
    CloseConnection = 4,
}

impl MessageType {
    /// Control messages consist of the header only.
    pub fn is_header_only(self) -> bool {
        matches!(
            self,
            MessageType::ValidateConnection | MessageType::CloseConnection
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::RequestBatch),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::ValidateConnection),
            4 => Ok(MessageType::CloseConnection),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Request => write!(f, "request"),
            MessageType::RequestBatch => write!(f, "request batch"),
            MessageType::Reply => write!(f, "reply"),
            MessageType::ValidateConnection => write!(f, "validate connection"),
            MessageType::CloseConnection => write!(f, "close connection"),
        }
    }
}

/// Compression status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionStatus {
    /// Not compressed, and the sender does not want compressed replies.
    #[default]
    NotCompressed = 0,
    /// Not compressed, but the sender accepts compressed replies.
    Supported = 1,
    /// Body is bzip2-compressed.
    Compressed = 2,
}

impl CompressionStatus {
    /// Whether a reply to this message may be compressed.
    pub fn accepts_compressed_reply(self) -> bool {
        self != CompressionStatus::NotCompressed
    }
}

impl TryFrom<u8> for CompressionStatus {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(CompressionStatus::NotCompressed),
            1 => Ok(CompressionStatus::Supported),
            2 => Ok(CompressionStatus::Compressed),
            other => Err(ProtocolError::InvalidCompressionStatus(other)),
        }
    }
}

/// A parsed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub protocol: ProtocolVersion,
    pub encoding: EncodingVersion,
    pub message_type: MessageType,
    pub compression: CompressionStatus,
    /// Total message size on the wire, header included.
    pub size: usize,
}

impl Header {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            protocol: PROTOCOL_1_0,
            encoding: HEADER_ENCODING,
            message_type,
            compression: CompressionStatus::NotCompressed,
            size: HEADER_SIZE,
        }
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(&MAGIC);
        buf.put_u8(self.protocol.major);
        buf.put_u8(self.protocol.minor);
        buf.put_u8(self.encoding.major);
        buf.put_u8(self.encoding.minor);
        buf.put_u8(self.message_type as u8);
        buf.put_u8(self.compression as u8);
        buf.put_i32_le(self.size as i32);
    }

    /// Parses and validates the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// Checks magic, versions, message type, compression status and that
    /// `size` lies in `[HEADER_SIZE, max_size]`.
    pub fn parse(buf: &[u8], max_size: usize) -> Result<Self, ProtocolError> {
        debug_assert!(buf.len() >= HEADER_SIZE);

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }

        let protocol = ProtocolVersion::new(buf[4], buf[5]);
        protocol.check_supported()?;

        let encoding = EncodingVersion::new(buf[6], buf[7]);
        encoding.check_header()?;

        let message_type = MessageType::try_from(buf[MESSAGE_TYPE_OFFSET])?;
        let compression = CompressionStatus::try_from(buf[COMPRESSION_OFFSET])?;

        let raw_size = i32::from_le_bytes([
            buf[SIZE_OFFSET],
            buf[SIZE_OFFSET + 1],
            buf[SIZE_OFFSET + 2],
            buf[SIZE_OFFSET + 3],
        ]);
        if raw_size < HEADER_SIZE as i32 {
            return Err(ProtocolError::IllegalMessageSize {
                size: raw_size.max(0) as usize,
                message_type,
            });
        }
        let size = raw_size as usize;
        if size > max_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: max_size,
            });
        }
        if message_type.is_header_only() && size != HEADER_SIZE {
            return Err(ProtocolError::IllegalMessageSize { size, message_type });
        }

        Ok(Self {
            protocol,
            encoding,
            message_type,
            compression,
            size,
        })
    }
}

/// Writes the buffer's length into its header size field.
pub fn patch_size(message: &mut [u8]) {
    let size = message.len() as i32;
    message[SIZE_OFFSET..SIZE_OFFSET + 4].copy_from_slice(&size.to_le_bytes());
}

/// Returns a buffer seeded with a header for `message_type`, ready for a
/// body to be appended.
pub fn start_message(message_type: MessageType, capacity: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + capacity);
    Header::new(message_type).write(&mut buf);
    buf
}

/// Patches the size of a complete message and, if `compress` is set,
/// compresses it (see [`compress::compress_message`]).
pub fn finish_message(mut message: BytesMut, compress: bool) -> Result<BytesMut, ProtocolError> {
    if i32::try_from(message.len()).is_err() {
        return Err(ProtocolError::MessageTooLarge {
            size: message.len(),
            max: i32::MAX as usize,
        });
    }
    patch_size(&mut message);
    if compress {
        compress::compress_message(message)
    } else {
        Ok(message)
    }
}

/// A complete protocol message. The body is always uncompressed.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    pub fn new(message_type: MessageType, body: Bytes) -> Self {
        let mut header = Header::new(message_type);
        header.size = HEADER_SIZE + body.len();
        Self { header, body }
    }

    pub fn validate_connection() -> Self {
        Self::new(MessageType::ValidateConnection, Bytes::new())
    }

    pub fn close_connection() -> Self {
        Self::new(MessageType::CloseConnection, Bytes::new())
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Encodes the frame, compressing the body if requested.
    pub fn encode(&self, compress: bool) -> Result<BytesMut, ProtocolError> {
        let mut buf = start_message(self.header.message_type, self.body.len());
        buf.put_slice(&self.body);
        finish_message(buf, compress && !self.header.message_type.is_header_only())
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete message was consumed,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut, max_size: usize) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            // Fail fast on garbage instead of waiting for a full header.
            let n = buf.len().min(MAGIC.len());
            if buf[..n] != MAGIC[..n] {
                let mut magic = [0u8; 4];
                magic[..n].copy_from_slice(&buf[..n]);
                return Err(ProtocolError::BadMagic(magic));
            }
            return Ok(None);
        }

        let header = Header::parse(&buf[..HEADER_SIZE], max_size)?;
        if buf.len() < header.size {
            return Ok(None);
        }

        let mut message = buf.split_to(header.size);
        let body = message.split_off(HEADER_SIZE).freeze();

        let body = match header.compression {
            CompressionStatus::Compressed => compress::decompress_body(body, max_size)?,
            _ => body,
        };

        Ok(Some(Self { header, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_MAX_MESSAGE_SIZE;

    fn header_bytes(message_type: u8, size: i32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_slice(&[1, 0, 1, 0, message_type, 0]);
        buf.put_i32_le(size);
        buf
    }

    #[test]
    fn test_frame_roundtrip() {
        let body = Bytes::from_static(b"\x01\x00\x00\x00payload");
        let frame = Frame::new(MessageType::Request, body.clone());
        let mut buf = frame.encode(false).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + body.len());

        let decoded = Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.message_type(), MessageType::Request);
        assert_eq!(decoded.header.compression, CompressionStatus::NotCompressed);
        assert_eq!(decoded.body, body);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_layout() {
        let buf = Frame::validate_connection().encode(false).unwrap();
        assert_eq!(
            &buf[..],
            &[b'I', b'c', b'e', b'P', 1, 0, 1, 0, 3, 0, 14, 0, 0, 0]
        );
    }

    #[test]
    fn test_every_message_type_accepted() {
        for t in 0u8..=4 {
            let size = if t >= 3 { 14 } else { 18 };
            let mut buf = header_bytes(t, size);
            buf.resize(size as usize, 0);
            let frame = Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE)
                .unwrap()
                .unwrap();
            assert_eq!(frame.message_type() as u8, t);
        }
    }

    #[test]
    fn test_any_corrupted_magic_byte_rejected() {
        for i in 0..4 {
            let mut buf = Frame::validate_connection().encode(false).unwrap();
            buf[i] ^= 0x20;
            let result = Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE);
            assert!(
                matches!(result, Err(ProtocolError::BadMagic(_))),
                "byte {i}"
            );
        }
    }

    #[test]
    fn test_bad_magic_detected_before_full_header() {
        let mut buf = BytesMut::from(&b"Ic"[..]);
        assert!(Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap()
            .is_none());
        let mut buf = BytesMut::from(&b"HTTP"[..]);
        assert!(matches!(
            Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE),
            Err(ProtocolError::BadMagic(_))
        ));
    }

    #[test]
    fn test_minor_protocol_skew_accepted() {
        let mut buf = header_bytes(3, 14);
        buf[5] = 9;
        assert!(Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_unsupported_major_version() {
        let mut buf = header_bytes(3, 14);
        buf[4] = 2;
        assert!(matches!(
            Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE),
            Err(ProtocolError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut buf = header_bytes(9, 14);
        assert!(matches!(
            Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE),
            Err(ProtocolError::UnknownMessageType(9))
        ));
    }

    #[test]
    fn test_invalid_compression_status() {
        let mut buf = header_bytes(0, 20);
        buf[COMPRESSION_OFFSET] = 7;
        assert!(matches!(
            Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE),
            Err(ProtocolError::InvalidCompressionStatus(7))
        ));
    }

    #[test]
    fn test_size_below_header() {
        let mut buf = header_bytes(0, 5);
        assert!(matches!(
            Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE),
            Err(ProtocolError::IllegalMessageSize { size: 5, .. })
        ));
    }

    #[test]
    fn test_size_above_maximum() {
        let mut buf = header_bytes(0, 1025);
        assert!(matches!(
            Frame::decode(&mut buf, 1024),
            Err(ProtocolError::MessageTooLarge {
                size: 1025,
                max: 1024
            })
        ));
    }

    #[test]
    fn test_control_message_with_body_rejected() {
        let mut buf = header_bytes(4, 15);
        buf.put_u8(0);
        assert!(matches!(
            Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE),
            Err(ProtocolError::IllegalMessageSize {
                message_type: MessageType::CloseConnection,
                ..
            })
        ));
    }

    #[test]
    fn test_incomplete_frame() {
        let frame = Frame::new(MessageType::Reply, Bytes::from_static(b"0123456789"));
        let encoded = frame.encode(false).unwrap();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap()
            .is_none());
        // Nothing consumed while waiting.
        assert_eq!(buf.len(), encoded.len() - 1);
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Frame::validate_connection().encode(false).unwrap());
        buf.extend_from_slice(
            &Frame::new(MessageType::Request, Bytes::from_static(b"abcd"))
                .encode(false)
                .unwrap(),
        );
        buf.extend_from_slice(&Frame::close_connection().encode(false).unwrap());

        let types: Vec<_> = std::iter::from_fn(|| {
            Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap()
        })
        .map(|f| f.message_type())
        .collect();
        assert_eq!(
            types,
            vec![
                MessageType::ValidateConnection,
                MessageType::Request,
                MessageType::CloseConnection
            ]
        );
    }

    #[test]
    fn test_control_messages_never_compressed() {
        let buf = Frame::close_connection().encode(true).unwrap();
        assert_eq!(buf[COMPRESSION_OFFSET], CompressionStatus::NotCompressed as u8);
        assert_eq!(buf.len(), HEADER_SIZE);
    }

    #[test]
    fn test_compression_status_reply_rule() {
        assert!(!CompressionStatus::NotCompressed.accepts_compressed_reply());
        assert!(CompressionStatus::Supported.accepts_compressed_reply());
        assert!(CompressionStatus::Compressed.accepts_compressed_reply());
    }
}
