//! edgelink client library
//!
//! Connects an edge device to the edgelink server over mutual TLS and keeps
//! two logical streams running on that connection: a heartbeat exchange and a
//! log forwarding feed. Transient failures are retried with backoff, a
//! rejected certificate identity is not.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use edgelink_client::{ClientConfig, EdgeClient, LogEntry};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = ClientConfig::new()
//!     .with_address("edge-gateway:50051")
//!     .with_heartbeat_interval(Duration::from_millis(500));
//!
//! let client = EdgeClient::new(config)?;
//! client
//!     .queues()
//!     .log_out
//!     .push(LogEntry::new(6, "boot", "device up"))
//!     .await?;
//!
//! client.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
mod client;
pub mod connection;
pub mod greeter;
pub mod streams;
pub mod syslog;

pub use backoff::{Backoff, BackoffConfig};
pub use client::*;
pub use connection::{CallOptions, Connection, ConnectionManager, ConnectionState, Queues};
pub use greeter::GreeterClient;
pub use streams::{InFlight, StreamMux};
pub use syslog::{parse_rfc5424, SyslogError, SyslogListener};

// Re-export important types from edgelink-common for convenience
pub use edgelink_common::{ClientCertPath, Error, HelloReply, HelloRequest, LogEntry};
