//! # rpcwire-core
//!
//! Connection runtime for rpcwire.
//!
//! This crate provides:
//! - The connection state machine and its send queue
//! - Outstanding invocation tracking and the retry engine
//! - The batch request queue
//! - Servant dispatch interfaces
//! - Configuration and observability hooks

pub mod batch;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod info;
pub mod invocation;
pub mod observer;
pub mod provider;
pub mod retry;
pub mod runtime;
pub mod transport;

pub use batch::{AutoFlush, BatchInfo, BatchRequestInterceptor, BatchRequestQueue, BatchSwap};
pub use config::{Config, ConfigError};
pub use connection::{CloseMode, Connection, ConnectionState, InvocationHandle, SendStatus};
pub use dispatch::{Current, DispatchError, DispatchResult, Dispatcher, ServantLocator};
pub use error::{ErrorKind, LocalError};
pub use info::ConnectionInfo;
pub use invocation::{InvocationFailure, InvocationResult, Response};
pub use observer::{NoopObserver, Observer, StatsObserver};
pub use provider::{ConnectionProvider, FixedConnection};
pub use retry::{RetryDecision, RetryPolicy, RetryQueue};
pub use runtime::Runtime;
pub use transport::{Transport, TransportInfo};
