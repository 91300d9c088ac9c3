//! # rpcwire-server
//!
//! TCP server for rpcwire.
//!
//! This crate provides:
//! - The TCP accept loop with a connection limit and graceful shutdown
//! - A servant registry keyed by identity and facet
//! - Dispatcher variants: per-operation tables, interceptors, echo

pub mod error;
pub mod servant;
pub mod server;

pub use error::ServerError;
pub use servant::{Echo, Interceptor, OperationTable, ServantMap};
pub use server::{Server, ServerConfig, ServerStats};
