//! edgelink server
//!
//! Accepts mutually authenticated TLS connections, admits each client by the
//! common name of its certificate and serves the greeter calls over the
//! multiplexed session:
//!
//! - `EmptyCall`: canary, echoes the caller's user agent
//! - `SayHello`: greets the admitted identity
//! - `Periodic`: timed replies while logging client heartbeats
//! - `Syslog`: receives forwarded log records
//!
//! # Example
//!
//! ```no_run
//! use edgelink_common::{config::ServerCertPath, InMemoryIdentityStore, ServerCredentials};
//! use edgelink_server::EdgeServer;
//! use tokio::net::TcpListener;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = InMemoryIdentityStore::allowing(["sati-pii"]);
//! let credentials = ServerCredentials::load(&ServerCertPath::new(), store)?;
//! let listener = TcpListener::bind("0.0.0.0:50051").await?;
//! EdgeServer::new(credentials).run(listener).await?;
//! # Ok(())
//! # }
//! ```

pub mod handler;
mod server;

pub use handler::{CallContext, ForwardedLog, Greeter, PeerInfo};
pub use server::{EdgeServer, ServerConfig, SessionState, DEFAULT_DRAIN_TIMEOUT};
