//! Batch request queue.
//!
//! Oneway requests are marshaled into a buffer that already holds a
//! RequestBatch header and a zero count. [`BatchRequestQueue::swap`]
//! patches the count, detaches the buffer and re-seeds a fresh one in a
//! single critical section.

use crate::error::LocalError;
use crate::transport::TransportInfo;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use rpcwire_protocol::frame::start_message;
use rpcwire_protocol::{MessageType, HEADER_SIZE};
use std::sync::Arc;

/// Size of the batch header: message header plus request count.
pub const BATCH_HEADER_SIZE: usize = HEADER_SIZE + 4;

/// Pending batch, as seen by an interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchInfo {
    pub count: usize,
    /// Current message size, header included.
    pub size: usize,
}

/// Consulted before each request is added to a batch.
pub trait BatchRequestInterceptor: Send + Sync {
    /// Returns true to flush the pending batch before adding a request of
    /// `request_size` bytes.
    fn flush_before(&self, pending: BatchInfo, request_size: usize) -> bool;
}

/// Flushes once adding a request would push the batch past `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct AutoFlush {
    pub threshold: usize,
}

impl BatchRequestInterceptor for AutoFlush {
    fn flush_before(&self, pending: BatchInfo, request_size: usize) -> bool {
        pending.count > 0 && pending.size + request_size > self.threshold
    }
}

/// A detached batch ready to be sent.
#[derive(Debug)]
pub struct BatchSwap {
    /// Complete message, count patched; the size field is patched when the
    /// message is finished for sending.
    pub bytes: BytesMut,
    pub count: usize,
    /// Every request in the batch asked for compression.
    pub compress: bool,
}

#[derive(Debug)]
struct BatchState {
    buf: BytesMut,
    count: usize,
    compress: bool,
}

impl BatchState {
    fn new() -> Self {
        let mut buf = start_message(MessageType::RequestBatch, 256);
        buf.put_i32_le(0);
        Self {
            buf,
            count: 0,
            compress: true,
        }
    }

    fn info(&self) -> BatchInfo {
        BatchInfo {
            count: self.count,
            size: self.buf.len(),
        }
    }

    fn take(&mut self) -> Option<BatchSwap> {
        if self.count == 0 {
            return None;
        }
        let mut fresh = BatchState::new();
        std::mem::swap(self, &mut fresh);
        let mut bytes = fresh.buf;
        bytes[HEADER_SIZE..BATCH_HEADER_SIZE].copy_from_slice(&(fresh.count as i32).to_le_bytes());
        Some(BatchSwap {
            bytes,
            count: fresh.count,
            compress: fresh.compress,
        })
    }
}

/// Buffer of marshaled oneway requests awaiting a flush.
pub struct BatchRequestQueue {
    state: Mutex<BatchState>,
    max_size: usize,
    interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
}

impl std::fmt::Debug for BatchRequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRequestQueue")
            .field("max_size", &self.max_size)
            .field("interceptor", &self.interceptor.is_some())
            .finish()
    }
}

impl BatchRequestQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(BatchState::new()),
            max_size,
            interceptor: None,
        }
    }

    /// Caps the size at the transport's datagram limit, if any.
    pub fn for_transport(max_size: usize, transport: &TransportInfo) -> Self {
        let max_size = match transport.max_datagram_size {
            Some(limit) if transport.datagram => max_size.min(limit),
            _ => max_size,
        };
        Self::new(max_size)
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn BatchRequestInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Appends a marshaled request body (everything after the request id).
    ///
    /// If the interceptor asks for a flush first, the pending batch is
    /// detached and returned; the caller must send it before anything
    /// else. Fails with [`LocalError::QueueTooBig`], leaving the queue
    /// untouched, if the request does not fit.
    pub fn enqueue(&self, request: &[u8], compress: bool) -> Result<Option<BatchSwap>, LocalError> {
        let mut state = self.state.lock();

        let flush_first = match &self.interceptor {
            Some(interceptor) => interceptor.flush_before(state.info(), request.len()),
            None => false,
        };
        let projected = if flush_first && state.count > 0 {
            BATCH_HEADER_SIZE + request.len()
        } else {
            state.buf.len() + request.len()
        };
        if projected > self.max_size {
            return Err(LocalError::QueueTooBig {
                size: projected,
                max: self.max_size,
            });
        }

        let flushed = if flush_first { state.take() } else { None };
        state.buf.put_slice(request);
        state.count += 1;
        state.compress &= compress;
        Ok(flushed)
    }

    /// Detaches the pending batch, or returns `None` if it is empty.
    pub fn swap(&self) -> Option<BatchSwap> {
        self.state.lock().take()
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.state.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current batch message size, header included.
    pub fn size(&self) -> usize {
        self.state.lock().buf.len()
    }
}
