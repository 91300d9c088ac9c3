//! # rpcwire-protocol
//!
//! Wire protocol implementation for rpcwire.
//!
//! This crate provides:
//! - A little-endian binary codec with bounds-checked encapsulations
//!   and skippable tagged (optional) values
//! - Message framing: 14-byte header validation and stream splitting
//! - Request, Reply and RequestBatch message bodies
//! - bzip2 message compression (cargo feature `bzip2`, on by default)

pub mod codec;
pub mod compress;
pub mod error;
pub mod frame;
pub mod framer;
pub mod message;
pub mod version;

pub use codec::{InputStream, OptionalFormat, OutputStream};
pub use error::{MarshalError, ProtocolError};
pub use frame::{CompressionStatus, Frame, Header, MessageType, HEADER_SIZE, MAGIC};
pub use framer::Framer;
pub use message::{
    encode_batch, Context, Encapsulation, Identity, Message, OperationMode, Reply, ReplyBody,
    ReplyStatus, Request, RequestFailedInfo,
};
pub use version::{EncodingVersion, ProtocolVersion, ENCODING_1_0, ENCODING_1_1};

/// Default port for rpcwire servers.
pub const DEFAULT_PORT: u16 = 10000;

/// Default maximum message size (4 MiB), header included.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
