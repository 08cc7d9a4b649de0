use std::{fmt, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::Identity;

/// Status codes carried by call trailers, a subset of the gRPC codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// Final outcome of a call, or the reason a connection went away
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code:    Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn data_loss(message: impl Into<String>) -> Self {
        Self::new(Code::DataLoss, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// Errors produced by the credential layer, the call substrate and the
/// queues
#[derive(Debug, Error)]
pub enum Error {
    /// TLS failure, ALPN mismatch, unreadable admission verdict or an
    /// exceeded handshake deadline
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// The caller cancelled an in-flight operation
    #[error("operation cancelled")]
    Cancelled,

    /// The peer's certificate identity is not on the allowlist
    #[error("certificate identity not authorized: {identity}")]
    Unauthenticated {
        identity: Identity,
    },

    /// A call reached a handler without an authorized peer identity
    #[error("invalid peer: {0}")]
    InvalidPeer(String),

    /// A send or receive failed mid-session; the connection is condemned
    #[error("stream failed: {0}")]
    Stream(Status),

    /// A queue was used after its owner closed it
    #[error("queue closed")]
    QueueClosed,

    /// A handler finished the call with a non-OK status
    #[error("call failed: {0}")]
    Status(Status),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    /// Certificate or key material could not be loaded
    #[error("TLS configuration error: {0}")]
    Config(String),

    /// The identity store could not answer
    #[error("identity store error: {0}")]
    Store(String),
}

impl Error {
    /// Whether retrying the same operation could succeed.
    ///
    /// Policy failures (`Unauthenticated`) and local configuration errors
    /// never are.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Handshake(_) | Error::Stream(_) | Error::Io(_) | Error::Codec(_) => true,
            Error::Status(status) => status.code == Code::Unavailable,
            Error::Cancelled
            | Error::Unauthenticated { .. }
            | Error::InvalidPeer(_)
            | Error::QueueClosed
            | Error::Config(_)
            | Error::Store(_) => false,
        }
    }

    /// Builds the error a caller sees for a non-OK call status
    pub fn from_status(status: Status) -> Self {
        match status.code {
            Code::Unavailable => Error::Stream(status),
            _ => Error::Status(status),
        }
    }

    /// Status sent to the peer when a handler fails with this error
    pub fn to_status(&self) -> Status {
        match self {
            Error::Status(status) | Error::Stream(status) => status.clone(),
            Error::Cancelled => Status::cancelled("call cancelled"),
            Error::Unauthenticated { identity } => {
                Status::new(Code::Unauthenticated, format!("cert not found: {identity}"))
            }
            Error::InvalidPeer(reason) => Status::internal(format!("invalid peer: {reason}")),
            Error::Codec(reason) => Status::new(Code::InvalidArgument, reason.clone()),
            other => Status::new(Code::Unknown, other.to_string()),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_failures_are_not_transient() {
        let rejected = Error::Unauthenticated {
            identity: Identity::new("edge-7"),
        };
        assert!(!rejected.is_transient());
        assert!(!Error::Config("bad pem".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn network_failures_are_transient() {
        assert!(Error::Handshake("reset".into()).is_transient());
        assert!(Error::Stream(Status::unavailable("eof")).is_transient());
        assert!(Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused)).is_transient());
    }

    #[test]
    fn unavailable_status_maps_to_stream_error() {
        let err = Error::from_status(Status::unavailable("peer went away"));
        assert!(matches!(err, Error::Stream(_)));

        let err = Error::from_status(Status::data_loss("missing expected user-agent"));
        match err {
            Error::Status(status) => assert_eq!(status.code, Code::DataLoss),
            other => panic!("unexpected error: {other}"),
        }
    }
}
