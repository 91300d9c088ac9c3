//! Binary value codec.
//!
//! All fixed-width numbers are little-endian. Sizes use a compact form: a
//! single byte for values below 255, otherwise `0xFF` followed by an i32.
//!
//! Encapsulation layout:
//!
//! ```text
//! +-----------+----------+----------+-----------------+
//! | size: i32 | enc major| enc minor| payload         |
//! | 4 bytes   | 1 byte   | 1 byte   | size - 6 bytes  |
//! +-----------+----------+----------+-----------------+
//! ```

use crate::error::MarshalError;
use crate::message::Encapsulation;
use crate::version::EncodingVersion;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the encapsulation header (size + encoding version).
pub const ENCAPSULATION_HEADER_SIZE: usize = 6;

/// Byte terminating a run of tagged values.
pub const OPTIONAL_END_MARKER: u8 = 0xFF;

/// Tag value that escapes to a size-encoded tag.
const TAG_ESCAPE: u8 = 30;

/// Wire format of a tagged (optional) value. The format alone is enough
/// to skip the value without knowing its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionalFormat {
    /// One byte.
    F1 = 0,
    /// Two bytes.
    F2 = 1,
    /// Four bytes.
    F4 = 2,
    /// Eight bytes.
    F8 = 3,
    /// A compact size.
    Size = 4,
    /// A compact size followed by that many bytes.
    VSize = 5,
    /// An i32 size followed by that many bytes.
    FSize = 6,
    /// A class instance.
    Class = 7,
}

impl OptionalFormat {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => OptionalFormat::F1,
            1 => OptionalFormat::F2,
            2 => OptionalFormat::F4,
            3 => OptionalFormat::F8,
            4 => OptionalFormat::Size,
            5 => OptionalFormat::VSize,
            6 => OptionalFormat::FSize,
            _ => OptionalFormat::Class,
        }
    }
}

#[derive(Debug)]
struct WriteEncaps {
    start: usize,
}

/// Growable output buffer.
#[derive(Debug, Default)]
pub struct OutputStream {
    buf: BytesMut,
    encaps: Vec<WriteEncaps>,
    /// First size that did not fit in an i32.
    overflow: Option<usize>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            ..Default::default()
        }
    }

    /// Continues writing at the end of an existing buffer.
    pub fn from_buf(buf: BytesMut) -> Self {
        Self {
            buf,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Returns the buffer, or [`MarshalError::SizeOverflow`] if any size
    /// written to it did not fit in 32 bits.
    pub fn finish(self) -> Result<BytesMut, MarshalError> {
        match self.overflow {
            Some(size) => Err(MarshalError::SizeOverflow(size)),
            None => Ok(self.buf),
        }
    }

    /// Converts a size for an i32 field. An oversized value is recorded
    /// and replaced by -1, which every reader rejects.
    fn size_i32(&mut self, size: usize) -> i32 {
        match i32::try_from(size) {
            Ok(n) => n,
            Err(_) => {
                self.overflow.get_or_insert(size);
                -1
            }
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// Overwrites four bytes at `pos` with `v`.
    pub fn rewrite_i32(&mut self, pos: usize, v: i32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn write_size(&mut self, size: usize) {
        if size < 255 {
            self.buf.put_u8(size as u8);
        } else {
            let n = self.size_i32(size);
            self.buf.put_u8(255);
            self.buf.put_i32_le(n);
        }
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_size(s.len());
        self.buf.put_slice(s.as_bytes());
    }

    pub fn write_string_seq(&mut self, seq: &[String]) {
        self.write_size(seq.len());
        for s in seq {
            self.write_string(s);
        }
    }

    pub fn write_byte_seq(&mut self, seq: &[u8]) {
        self.write_size(seq.len());
        self.buf.put_slice(seq);
    }

    pub fn write_i32_seq(&mut self, seq: &[i32]) {
        self.write_size(seq.len());
        for v in seq {
            self.buf.put_i32_le(*v);
        }
    }

    /// Opens an encapsulation; its size is patched in by
    /// [`end_encapsulation`](Self::end_encapsulation).
    pub fn start_encapsulation(&mut self, encoding: EncodingVersion) {
        let start = self.buf.len();
        self.buf.put_i32_le(0);
        self.buf.put_u8(encoding.major);
        self.buf.put_u8(encoding.minor);
        self.encaps.push(WriteEncaps { start });
    }

    pub fn end_encapsulation(&mut self) -> Result<(), MarshalError> {
        let encaps = self.encaps.pop().ok_or(MarshalError::NoEncapsulation)?;
        let size = self.buf.len() - encaps.start;
        let size = i32::try_from(size).map_err(|_| MarshalError::SizeOverflow(size))?;
        self.rewrite_i32(encaps.start, size);
        Ok(())
    }

    pub fn write_empty_encapsulation(&mut self, encoding: EncodingVersion) {
        self.buf.put_i32_le(ENCAPSULATION_HEADER_SIZE as i32);
        self.buf.put_u8(encoding.major);
        self.buf.put_u8(encoding.minor);
    }

    pub fn write_encapsulation(&mut self, encaps: &Encapsulation) {
        let size = self.size_i32(encaps.wire_size());
        self.buf.put_i32_le(size);
        self.buf.put_u8(encaps.encoding.major);
        self.buf.put_u8(encaps.encoding.minor);
        self.buf.put_slice(&encaps.payload);
    }

    /// Writes the tag byte (and escaped tag, if needed) of an optional value.
    pub fn write_optional(&mut self, tag: u32, format: OptionalFormat) {
        if tag < u32::from(TAG_ESCAPE) {
            self.buf.put_u8((format as u8) | ((tag as u8) << 3));
        } else {
            self.buf.put_u8((format as u8) | (TAG_ESCAPE << 3));
            self.write_size(tag as usize);
        }
    }

    pub fn write_optional_end_marker(&mut self) {
        self.buf.put_u8(OPTIONAL_END_MARKER);
    }
}

#[derive(Debug, Clone, Copy)]
struct ReadEncaps {
    end: usize,
    encoding: EncodingVersion,
}

/// Cursor over a received buffer.
///
/// Reads inside an encapsulation are bounded by the encapsulation's
/// declared end, never by the end of the whole buffer.
#[derive(Debug, Clone)]
pub struct InputStream {
    buf: Bytes,
    pos: usize,
    encaps: Vec<ReadEncaps>,
}

impl InputStream {
    pub fn new(buf: Bytes) -> Self {
        Self {
            buf,
            pos: 0,
            encaps: Vec::new(),
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(data))
    }

    /// Stream over an encapsulation payload whose header was already
    /// consumed. Close it with [`end_encapsulation`](Self::end_encapsulation).
    pub fn with_encoding(payload: Bytes, encoding: EncodingVersion) -> Self {
        let end = payload.len();
        Self {
            buf: payload,
            pos: 0,
            encaps: vec![ReadEncaps { end, encoding }],
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn limit(&self) -> usize {
        self.encaps.last().map_or(self.buf.len(), |e| e.end)
    }

    /// Bytes left before the current bound.
    pub fn remaining(&self) -> usize {
        self.limit() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.remaining() == 0
    }

    /// Fails unless the whole buffer has been consumed.
    pub fn expect_end(&self) -> Result<(), MarshalError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            n => Err(MarshalError::TrailingBytes(n)),
        }
    }

    fn need(&self, n: usize) -> Result<(), MarshalError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(MarshalError::OutOfBounds {
                needed: n,
                remaining,
            });
        }
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], MarshalError> {
        self.need(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), MarshalError> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, MarshalError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, MarshalError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16, MarshalError> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, MarshalError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, MarshalError> {
        Ok(i64::from_le_bytes(self.take()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, MarshalError> {
        Ok(f32::from_le_bytes(self.take()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, MarshalError> {
        Ok(f64::from_le_bytes(self.take()?))
    }

    pub fn read_size(&mut self) -> Result<usize, MarshalError> {
        let b = self.read_u8()?;
        if b < 255 {
            return Ok(b as usize);
        }
        let v = self.read_i32()?;
        if v < 0 {
            return Err(MarshalError::NegativeSize(v));
        }
        Ok(v as usize)
    }

    /// Reads a sequence size and checks that `size` elements of at least
    /// `min_wire_size` bytes each can fit in what is left.
    pub fn read_seq_size(&mut self, min_wire_size: usize) -> Result<usize, MarshalError> {
        let size = self.read_size()?;
        let remaining = self.remaining();
        if size.saturating_mul(min_wire_size) > remaining {
            return Err(MarshalError::InvalidSequenceSize { size, remaining });
        }
        Ok(size)
    }

    /// Reads `n` raw bytes without copying.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes, MarshalError> {
        self.need(n)?;
        let out = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    pub fn read_string(&mut self) -> Result<String, MarshalError> {
        let len = self.read_size()?;
        if len == 0 {
            return Ok(String::new());
        }
        self.need(len)?;
        let s = std::str::from_utf8(&self.buf[self.pos..self.pos + len])
            .map_err(|_| MarshalError::InvalidUtf8)?
            .to_owned();
        self.pos += len;
        Ok(s)
    }

    pub fn read_string_seq(&mut self) -> Result<Vec<String>, MarshalError> {
        let n = self.read_seq_size(1)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_string()?);
        }
        Ok(out)
    }

    pub fn read_byte_seq(&mut self) -> Result<Bytes, MarshalError> {
        let n = self.read_seq_size(1)?;
        self.read_bytes(n)
    }

    pub fn read_i32_seq(&mut self) -> Result<Vec<i32>, MarshalError> {
        let n = self.read_seq_size(4)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_i32()?);
        }
        Ok(out)
    }

    fn read_encapsulation_header(&mut self) -> Result<(usize, EncodingVersion), MarshalError> {
        let size = self.read_i32()?;
        if size < ENCAPSULATION_HEADER_SIZE as i32 {
            return Err(MarshalError::InvalidEncapsulationSize(size));
        }
        let body = size as usize - 4;
        self.need(body)?;
        let major = self.read_u8()?;
        let minor = self.read_u8()?;
        Ok((
            size as usize - ENCAPSULATION_HEADER_SIZE,
            EncodingVersion::new(major, minor),
        ))
    }

    /// Enters an encapsulation. Until the matching
    /// [`end_encapsulation`](Self::end_encapsulation), reads are bounded by
    /// the encapsulation's declared size.
    pub fn start_encapsulation(&mut self) -> Result<EncodingVersion, MarshalError> {
        let (payload, encoding) = self.read_encapsulation_header()?;
        encoding.check_supported()?;
        self.encaps.push(ReadEncaps {
            end: self.pos + payload,
            encoding,
        });
        Ok(encoding)
    }

    /// Leaves the current encapsulation. Trailing tagged values are skipped
    /// for 1.1 encapsulations; any other unread byte is an error.
    pub fn end_encapsulation(&mut self) -> Result<(), MarshalError> {
        let current = *self.encaps.last().ok_or(MarshalError::NoEncapsulation)?;
        if self.pos < current.end && !current.encoding.is_1_0() {
            self.skip_optionals()?;
        }
        if self.pos != current.end {
            return Err(MarshalError::EncapsulationNotConsumed(current.end - self.pos));
        }
        self.encaps.pop();
        Ok(())
    }

    /// Encoding of the innermost open encapsulation.
    pub fn encoding(&self) -> Option<EncodingVersion> {
        self.encaps.last().map(|e| e.encoding)
    }

    pub fn skip_encapsulation(&mut self) -> Result<EncodingVersion, MarshalError> {
        let (payload, encoding) = self.read_encapsulation_header()?;
        self.skip(payload)?;
        Ok(encoding)
    }

    /// Reads an encapsulation as an opaque payload.
    pub fn read_encapsulation(&mut self) -> Result<Encapsulation, MarshalError> {
        let (payload, encoding) = self.read_encapsulation_header()?;
        let payload = self.read_bytes(payload)?;
        Ok(Encapsulation { encoding, payload })
    }

    /// Positions the stream on the tagged value `tag` of the given format.
    ///
    /// Tagged values with a lower tag are skipped. Returns `false`, without
    /// consuming anything further, if the value is absent.
    pub fn read_optional(&mut self, tag: u32, expected: OptionalFormat) -> Result<bool, MarshalError> {
        if self.encoding().map_or(true, EncodingVersion::is_1_0) {
            return Ok(false);
        }
        loop {
            if self.is_at_end() {
                return Ok(false);
            }
            let start = self.pos;
            let v = self.read_u8()?;
            if v == OPTIONAL_END_MARKER {
                self.pos = start;
                return Ok(false);
            }
            let format = OptionalFormat::from_bits(v);
            let mut read_tag = u32::from(v >> 3);
            if read_tag == u32::from(TAG_ESCAPE) {
                read_tag = self.read_size()? as u32;
            }
            if read_tag > tag {
                self.pos = start;
                return Ok(false);
            }
            if read_tag < tag {
                self.skip_optional(format)?;
                continue;
            }
            if format != expected {
                return Err(MarshalError::OptionalFormatMismatch {
                    expected: expected as u8,
                    actual: format as u8,
                });
            }
            return Ok(true);
        }
    }

    /// Skips the value of a tagged member whose tag byte was already read.
    pub fn skip_optional(&mut self, format: OptionalFormat) -> Result<(), MarshalError> {
        match format {
            OptionalFormat::F1 => self.skip(1),
            OptionalFormat::F2 => self.skip(2),
            OptionalFormat::F4 => self.skip(4),
            OptionalFormat::F8 => self.skip(8),
            OptionalFormat::Size => self.read_size().map(|_| ()),
            OptionalFormat::VSize => {
                let n = self.read_size()?;
                self.skip(n)
            }
            OptionalFormat::FSize => {
                let n = self.read_i32()?;
                if n < 0 {
                    return Err(MarshalError::NegativeSize(n));
                }
                self.skip(n as usize)
            }
            OptionalFormat::Class => Err(MarshalError::ClassSkipUnsupported),
        }
    }

    /// Skips tagged values up to the end marker or the current bound.
    pub fn skip_optionals(&mut self) -> Result<(), MarshalError> {
        while !self.is_at_end() {
            let v = self.read_u8()?;
            if v == OPTIONAL_END_MARKER {
                return Ok(());
            }
            if v >> 3 == TAG_ESCAPE {
                self.read_size()?;
            }
            self.skip_optional(OptionalFormat::from_bits(v))?;
        }
        Ok(())
    }
}
