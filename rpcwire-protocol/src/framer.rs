//! Splits a transport byte stream into protocol messages.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::DEFAULT_MAX_MESSAGE_SIZE;
use bytes::BytesMut;

/// Incremental message reader.
///
/// Bytes are appended as they arrive; [`try_read_message`](Self::try_read_message)
/// hands out complete messages once their declared size is buffered.
pub struct Framer {
    buffer: BytesMut,
    max_message_size: usize,
}

impl Framer {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_message_size,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to read the next message.
    ///
    /// `Ok(None)` means more bytes are needed; nothing is consumed in that
    /// case. Any error leaves the stream unusable.
    pub fn try_read_message(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer, self.max_message_size)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}
