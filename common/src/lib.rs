//! edgelink common library
//!
//! Shared building blocks for the edgelink client and server:
//!
//! - Credential layer: mutual TLS, ALPN pinning and identity admission
//! - Wire frames and multiplexed unary / streaming calls over one session
//! - Bounded queues linking producers and consumers to logical streams
//! - Certificate path configuration and the shared error type

/// Certificate paths and protocol constants
pub mod config;

pub mod error;

/// Certificate identities and the allowlist
pub mod identity;

/// Call payloads
pub mod message;

/// Multiplexed calls over an admitted session
pub mod mux;

pub mod queue;

/// Mutual TLS handshakes and admission
pub mod tls;

/// Frame format and codec
pub mod wire;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export commonly used types for convenience
pub use config::{ClientCertPath, ServerCertPath, ALPN_PROTOCOL, DEFAULT_PORT};
pub use error::{Code, Error, Status};
pub use identity::{Identity, IdentityStore, InMemoryIdentityStore};
pub use message::{Empty, HelloReply, HelloRequest, LogEntry};
pub use mux::{CallReceiver, CallSender, IncomingCall, MuxConnection};
pub use queue::{InboundQueue, OutboundQueue, Queue};
pub use tls::{ClientCredentials, ServerCredentials};
pub use wire::{Metadata, Method};
