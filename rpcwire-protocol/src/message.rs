//! Message bodies.
//!
//! Request body:
//!
//! ```text
//! request id: i32 | identity | facet | operation | mode: u8 | context | params
//! ```
//!
//! A batch body is an i32 count followed by that many requests without
//! request ids. A reply body is the request id, a status byte and a
//! status-dependent payload.

use crate::codec::{InputStream, OutputStream, ENCAPSULATION_HEADER_SIZE};
use crate::error::{MarshalError, ProtocolError};
use crate::frame::{finish_message, start_message, Frame, MessageType};
use crate::version::{EncodingVersion, ENCODING_1_1};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;

/// Request context: string key/value pairs sent with every request.
pub type Context = BTreeMap<String, String>;

/// Identity of a target object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn write(&self, os: &mut OutputStream) {
        os.write_string(&self.name);
        os.write_string(&self.category);
    }

    pub fn read(is: &mut InputStream) -> Result<Self, MarshalError> {
        let name = is.read_string()?;
        let category = is.read_string()?;
        Ok(Self { name, category })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

/// Operation mode carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum OperationMode {
    #[default]
    Normal = 0,
    Nonmutating = 1,
    Idempotent = 2,
}

impl OperationMode {
    /// Idempotent operations may be retried even after they were sent.
    pub fn is_idempotent(self) -> bool {
        self != OperationMode::Normal
    }
}

impl TryFrom<u8> for OperationMode {
    type Error = MarshalError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(OperationMode::Normal),
            1 => Ok(OperationMode::Nonmutating),
            2 => Ok(OperationMode::Idempotent),
            value => Err(MarshalError::InvalidEnumerator {
                what: "operation mode",
                value,
            }),
        }
    }
}

/// An encapsulation kept as an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encapsulation {
    pub encoding: EncodingVersion,
    pub payload: Bytes,
}

impl Encapsulation {
    pub fn new(encoding: EncodingVersion, payload: impl Into<Bytes>) -> Self {
        Self {
            encoding,
            payload: payload.into(),
        }
    }

    pub fn empty(encoding: EncodingVersion) -> Self {
        Self::new(encoding, Bytes::new())
    }

    /// Builds an encapsulation by writing its payload with `f`.
    pub fn build(encoding: EncodingVersion, f: impl FnOnce(&mut OutputStream)) -> Self {
        let mut os = OutputStream::new();
        f(&mut os);
        Self::new(encoding, os.freeze())
    }

    /// Size on the wire, header included.
    pub fn wire_size(&self) -> usize {
        ENCAPSULATION_HEADER_SIZE + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Opens the payload for reading. Finish with
    /// [`InputStream::end_encapsulation`].
    pub fn reader(&self) -> Result<InputStream, MarshalError> {
        self.encoding.check_supported()?;
        Ok(InputStream::with_encoding(self.payload.clone(), self.encoding))
    }
}

impl Default for Encapsulation {
    fn default() -> Self {
        Self::empty(ENCODING_1_1)
    }
}

/// A request without its request id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    pub identity: Identity,
    /// Empty for the default facet.
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    pub params: Encapsulation,
}

impl Request {
    pub fn new(identity: Identity, operation: impl Into<String>) -> Self {
        Self {
            identity,
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = facet.into();
        self
    }

    pub fn with_mode(mut self, mode: OperationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_params(mut self, params: Encapsulation) -> Self {
        self.params = params;
        self
    }

    /// Writes everything after the request id.
    pub fn write_body(&self, os: &mut OutputStream) {
        self.identity.write(os);
        write_facet(os, &self.facet);
        os.write_string(&self.operation);
        os.write_u8(self.mode as u8);
        write_context(os, &self.context);
        os.write_encapsulation(&self.params);
    }

    pub fn read_body(is: &mut InputStream) -> Result<Self, MarshalError> {
        let identity = Identity::read(is)?;
        let facet = read_facet(is)?;
        let operation = is.read_string()?;
        let mode = OperationMode::try_from(is.read_u8()?)?;
        let context = read_context(is)?;
        let params = is.read_encapsulation()?;
        Ok(Self {
            identity,
            facet,
            operation,
            mode,
            context,
            params,
        })
    }

    /// Encodes a complete request message. A request id of 0 marks a
    /// oneway request.
    pub fn encode(&self, request_id: i32, compress: bool) -> Result<BytesMut, ProtocolError> {
        let mut os = OutputStream::from_buf(start_message(
            MessageType::Request,
            4 + self.operation.len() + self.params.wire_size() + 32,
        ));
        os.write_i32(request_id);
        self.write_body(&mut os);
        finish_message(os.finish()?, compress)
    }

    /// Request body as it appears inside a batch.
    pub fn encode_batch_entry(&self) -> Bytes {
        let mut os = OutputStream::with_capacity(self.params.wire_size() + 32);
        self.write_body(&mut os);
        os.freeze()
    }
}

fn write_facet(os: &mut OutputStream, facet: &str) {
    if facet.is_empty() {
        os.write_size(0);
    } else {
        os.write_size(1);
        os.write_string(facet);
    }
}

fn read_facet(is: &mut InputStream) -> Result<String, MarshalError> {
    let mut path = is.read_string_seq()?;
    match path.len() {
        0 => Ok(String::new()),
        1 => Ok(path.remove(0)),
        n => Err(MarshalError::InvalidFacetPath(n)),
    }
}

pub fn write_context(os: &mut OutputStream, context: &Context) {
    os.write_size(context.len());
    for (key, value) in context {
        os.write_string(key);
        os.write_string(value);
    }
}

pub fn read_context(is: &mut InputStream) -> Result<Context, MarshalError> {
    let n = is.read_seq_size(2)?;
    let mut context = Context::new();
    for _ in 0..n {
        let key = is.read_string()?;
        let value = is.read_string()?;
        context.insert(key, value);
    }
    Ok(context)
}

/// Reply status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    UnknownLocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = MarshalError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(ReplyStatus::Ok),
            1 => Ok(ReplyStatus::UserException),
            2 => Ok(ReplyStatus::ObjectNotExist),
            3 => Ok(ReplyStatus::FacetNotExist),
            4 => Ok(ReplyStatus::OperationNotExist),
            5 => Ok(ReplyStatus::UnknownLocalException),
            6 => Ok(ReplyStatus::UnknownUserException),
            7 => Ok(ReplyStatus::UnknownException),
            value => Err(MarshalError::InvalidEnumerator {
                what: "reply status",
                value,
            }),
        }
    }
}

/// Target of a request that could not be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestFailedInfo {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
}

impl RequestFailedInfo {
    pub fn for_request(request: &Request) -> Self {
        Self {
            identity: request.identity.clone(),
            facet: request.facet.clone(),
            operation: request.operation.clone(),
        }
    }

    fn write(&self, os: &mut OutputStream) {
        self.identity.write(os);
        write_facet(os, &self.facet);
        os.write_string(&self.operation);
    }

    fn read(is: &mut InputStream) -> Result<Self, MarshalError> {
        let identity = Identity::read(is)?;
        let facet = read_facet(is)?;
        let operation = is.read_string()?;
        Ok(Self {
            identity,
            facet,
            operation,
        })
    }
}

impl fmt::Display for RequestFailedInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identity '{}'", self.identity)?;
        if !self.facet.is_empty() {
            write!(f, " facet '{}'", self.facet)?;
        }
        write!(f, " operation '{}'", self.operation)
    }
}

/// Status-dependent reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Ok(Encapsulation),
    UserException(Encapsulation),
    ObjectNotExist(RequestFailedInfo),
    FacetNotExist(RequestFailedInfo),
    OperationNotExist(RequestFailedInfo),
    UnknownLocalException(String),
    UnknownUserException(String),
    UnknownException(String),
}

impl ReplyBody {
    pub fn status(&self) -> ReplyStatus {
        match self {
            ReplyBody::Ok(_) => ReplyStatus::Ok,
            ReplyBody::UserException(_) => ReplyStatus::UserException,
            ReplyBody::ObjectNotExist(_) => ReplyStatus::ObjectNotExist,
            ReplyBody::FacetNotExist(_) => ReplyStatus::FacetNotExist,
            ReplyBody::OperationNotExist(_) => ReplyStatus::OperationNotExist,
            ReplyBody::UnknownLocalException(_) => ReplyStatus::UnknownLocalException,
            ReplyBody::UnknownUserException(_) => ReplyStatus::UnknownUserException,
            ReplyBody::UnknownException(_) => ReplyStatus::UnknownException,
        }
    }

    pub fn write(&self, os: &mut OutputStream) {
        os.write_u8(self.status() as u8);
        match self {
            ReplyBody::Ok(encaps) | ReplyBody::UserException(encaps) => {
                os.write_encapsulation(encaps)
            }
            ReplyBody::ObjectNotExist(info)
            | ReplyBody::FacetNotExist(info)
            | ReplyBody::OperationNotExist(info) => info.write(os),
            ReplyBody::UnknownLocalException(reason)
            | ReplyBody::UnknownUserException(reason)
            | ReplyBody::UnknownException(reason) => os.write_string(reason),
        }
    }

    pub fn read(is: &mut InputStream) -> Result<Self, MarshalError> {
        let body = match ReplyStatus::try_from(is.read_u8()?)? {
            ReplyStatus::Ok => ReplyBody::Ok(is.read_encapsulation()?),
            ReplyStatus::UserException => ReplyBody::UserException(is.read_encapsulation()?),
            ReplyStatus::ObjectNotExist => ReplyBody::ObjectNotExist(RequestFailedInfo::read(is)?),
            ReplyStatus::FacetNotExist => ReplyBody::FacetNotExist(RequestFailedInfo::read(is)?),
            ReplyStatus::OperationNotExist => {
                ReplyBody::OperationNotExist(RequestFailedInfo::read(is)?)
            }
            ReplyStatus::UnknownLocalException => {
                ReplyBody::UnknownLocalException(is.read_string()?)
            }
            ReplyStatus::UnknownUserException => {
                ReplyBody::UnknownUserException(is.read_string()?)
            }
            ReplyStatus::UnknownException => ReplyBody::UnknownException(is.read_string()?),
        };
        Ok(body)
    }
}

/// A reply addressed to an outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub request_id: i32,
    pub body: ReplyBody,
}

impl Reply {
    pub fn new(request_id: i32, body: ReplyBody) -> Self {
        Self { request_id, body }
    }

    pub fn encode(&self, compress: bool) -> Result<BytesMut, ProtocolError> {
        let mut os = OutputStream::from_buf(start_message(MessageType::Reply, 64));
        os.write_i32(self.request_id);
        self.body.write(&mut os);
        finish_message(os.finish()?, compress)
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request {
        request_id: i32,
        request: Request,
    },
    RequestBatch(Vec<Request>),
    /// The request id is always known; a body that fails to decode is
    /// reported to that one invocation only.
    Reply {
        request_id: i32,
        body: Result<ReplyBody, MarshalError>,
    },
    ValidateConnection,
    CloseConnection,
}

impl Message {
    /// Decodes the body of a frame.
    ///
    /// Errors are fatal to the connection. The exception is a reply whose
    /// id was read but whose body is malformed: that error is carried in
    /// [`Message::Reply`].
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let mut is = InputStream::new(frame.body.clone());
        let message = match frame.message_type() {
            MessageType::Request => {
                let request_id = is.read_i32()?;
                let request = Request::read_body(&mut is)?;
                is.expect_end()?;
                Message::Request {
                    request_id,
                    request,
                }
            }
            MessageType::RequestBatch => {
                let count = is.read_i32()?;
                if count < 0 {
                    return Err(MarshalError::NegativeSize(count).into());
                }
                // Each request takes at least a dozen bytes; do not trust
                // the count for preallocation.
                let mut requests = Vec::with_capacity((count as usize).min(is.remaining() / 12));
                for _ in 0..count {
                    requests.push(Request::read_body(&mut is)?);
                }
                is.expect_end()?;
                Message::RequestBatch(requests)
            }
            MessageType::Reply => {
                let request_id = is.read_i32()?;
                let body = ReplyBody::read(&mut is).and_then(|body| {
                    is.expect_end()?;
                    Ok(body)
                });
                Message::Reply { request_id, body }
            }
            MessageType::ValidateConnection => Message::ValidateConnection,
            MessageType::CloseConnection => Message::CloseConnection,
        };
        Ok(message)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request { .. } => MessageType::Request,
            Message::RequestBatch(_) => MessageType::RequestBatch,
            Message::Reply { .. } => MessageType::Reply,
            Message::ValidateConnection => MessageType::ValidateConnection,
            Message::CloseConnection => MessageType::CloseConnection,
        }
    }
}

/// Encodes a batch message from pre-encoded request bodies.
pub fn encode_batch(
    count: usize,
    bodies: &[u8],
    compress: bool,
) -> Result<BytesMut, ProtocolError> {
    let mut buf = start_message(MessageType::RequestBatch, 4 + bodies.len());
    buf.put_i32_le(count as i32);
    buf.put_slice(bodies);
    finish_message(buf, compress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_SIZE;
    use crate::version::ENCODING_1_0;
    use crate::DEFAULT_MAX_MESSAGE_SIZE;

    fn decode(mut buf: BytesMut) -> Message {
        let frame = Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap()
            .unwrap();
        Message::from_frame(&frame).unwrap()
    }

    fn sample_request() -> Request {
        let mut context = Context::new();
        context.insert("tenant".to_string(), "blue".to_string());
        Request::new(Identity::new("printer").with_category("devices"), "print")
            .with_facet("v2")
            .with_mode(OperationMode::Idempotent)
            .with_context(context)
            .with_params(Encapsulation::build(ENCODING_1_1, |os| {
                os.write_string("hello");
                os.write_i32(3);
            }))
    }

    #[test]
    fn test_request_roundtrip() {
        let request = sample_request();
        let buf = request.encode(42, false).unwrap();
        match decode(buf) {
            Message::Request {
                request_id,
                request: decoded,
            } => {
                assert_eq!(request_id, 42);
                assert_eq!(decoded, request);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_request_wire_layout() {
        let request = Request::new(Identity::new("a"), "op");
        let buf = request.encode(1, false).unwrap();
        let body = &buf[HEADER_SIZE..];
        #[rustfmt::skip]
        let expected: &[u8] = &[
            1, 0, 0, 0,             // request id
            1, b'a', 0,             // identity name, category
            0,                      // facet
            2, b'o', b'p',          // operation
            0,                      // mode
            0,                      // context
            6, 0, 0, 0, 1, 1,       // empty 1.1 encapsulation
        ];
        assert_eq!(body, expected);
    }

    #[test]
    fn test_params_readable_inside_encapsulation() {
        let request = sample_request();
        let mut is = request.params.reader().unwrap();
        assert_eq!(is.read_string().unwrap(), "hello");
        assert_eq!(is.read_i32().unwrap(), 3);
        is.end_encapsulation().unwrap();
    }

    #[test]
    fn test_oversized_facet_path_rejected() {
        let mut os = OutputStream::new();
        Identity::new("x").write(&mut os);
        os.write_string_seq(&["a".to_string(), "b".to_string()]);
        let mut is = InputStream::new(os.freeze());
        Identity::read(&mut is).unwrap();
        assert_eq!(read_facet(&mut is), Err(MarshalError::InvalidFacetPath(2)));
    }

    #[test]
    fn test_invalid_operation_mode() {
        assert!(matches!(
            OperationMode::try_from(3),
            Err(MarshalError::InvalidEnumerator { value: 3, .. })
        ));
        assert!(OperationMode::Nonmutating.is_idempotent());
        assert!(!OperationMode::Normal.is_idempotent());
    }

    #[test]
    fn test_reply_statuses_roundtrip() {
        let info = RequestFailedInfo {
            identity: Identity::new("gone"),
            facet: String::new(),
            operation: "ping".to_string(),
        };
        let bodies = vec![
            ReplyBody::Ok(Encapsulation::new(ENCODING_1_1, &b"\x07"[..])),
            ReplyBody::UserException(Encapsulation::empty(ENCODING_1_0)),
            ReplyBody::ObjectNotExist(info.clone()),
            ReplyBody::FacetNotExist(info.clone()),
            ReplyBody::OperationNotExist(info),
            ReplyBody::UnknownLocalException("local".to_string()),
            ReplyBody::UnknownUserException("user".to_string()),
            ReplyBody::UnknownException("other".to_string()),
        ];
        for (status, body) in bodies.into_iter().enumerate() {
            assert_eq!(body.status() as usize, status);
            let buf = Reply::new(9, body.clone()).encode(false).unwrap();
            assert_eq!(
                decode(buf),
                Message::Reply {
                    request_id: 9,
                    body: Ok(body)
                }
            );
        }
    }

    #[test]
    fn test_malformed_reply_body_keeps_request_id() {
        let mut body = BytesMut::new();
        body.put_i32_le(17);
        body.put_u8(42);
        let frame = Frame::new(MessageType::Reply, body.freeze());
        match Message::from_frame(&frame).unwrap() {
            Message::Reply { request_id, body } => {
                assert_eq!(request_id, 17);
                assert!(matches!(
                    body,
                    Err(MarshalError::InvalidEnumerator { value: 42, .. })
                ));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_reply_trailing_bytes_is_body_error() {
        let mut buf = Reply::new(3, ReplyBody::UnknownException("x".into()))
            .encode(false)
            .unwrap();
        buf.put_u8(0);
        crate::frame::patch_size(&mut buf);
        match decode(buf) {
            Message::Reply { body, .. } => {
                assert_eq!(body, Err(MarshalError::TrailingBytes(1)));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_reply_without_id_is_fatal() {
        let frame = Frame::new(MessageType::Reply, Bytes::from_static(&[1, 0]));
        assert!(matches!(
            Message::from_frame(&frame),
            Err(ProtocolError::Marshal(MarshalError::OutOfBounds { .. }))
        ));
    }

    #[test]
    fn test_batch_roundtrip() {
        let first = Request::new(Identity::new("a"), "one");
        let second = sample_request();
        let mut bodies = Vec::new();
        bodies.extend_from_slice(&first.encode_batch_entry());
        bodies.extend_from_slice(&second.encode_batch_entry());

        let buf = encode_batch(2, &bodies, false).unwrap();
        assert_eq!(
            decode(buf),
            Message::RequestBatch(vec![first, second])
        );
    }

    #[test]
    fn test_batch_count_exceeding_body_rejected() {
        let body = Request::new(Identity::new("a"), "one").encode_batch_entry();
        let mut buf = encode_batch(5, &body, false).unwrap();
        let frame = Frame::decode(&mut buf, DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap()
            .unwrap();
        assert!(Message::from_frame(&frame).is_err());
    }

    #[test]
    fn test_control_messages() {
        assert_eq!(
            decode(Frame::validate_connection().encode(false).unwrap()),
            Message::ValidateConnection
        );
        assert_eq!(
            decode(Frame::close_connection().encode(false).unwrap()).message_type(),
            MessageType::CloseConnection
        );
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::new("obj").to_string(), "obj");
        assert_eq!(
            Identity::new("obj").with_category("cat").to_string(),
            "cat/obj"
        );
    }
}
