//! # rpcwire-client
//!
//! Client library for rpcwire.
//!
//! This crate provides:
//! - A TCP connector that caches and re-establishes connections
//! - Proxies that invoke operations under the runtime's retry policy
//! - Oneway and batched oneway invocations
//!
//! ## Example
//!
//! ```rust,no_run
//! use rpcwire_client::{Proxy, TcpConnector};
//! use rpcwire_core::{Config, Runtime};
//! use rpcwire_protocol::Identity;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Runtime::new(Config::default());
//!     let connector = Arc::new(TcpConnector::new(runtime.clone(), "127.0.0.1:10000"));
//!     let proxy = Proxy::new(Identity::new("echo"), connector, runtime);
//!
//!     proxy.ice_ping().await?;
//!     Ok(())
//! }
//! ```

pub mod connector;
pub mod error;
pub mod proxy;

pub use connector::TcpConnector;
pub use error::ClientError;
pub use proxy::Proxy;
