//! Frames exchanged over an established TLS session.
//!
//! Every frame is a bincode-encoded [`Frame`] behind a 4-byte little-endian
//! length prefix. The first frame after the handshake is always the server's
//! admission verdict ([`Frame::Admitted`] or [`Frame::Rejected`]); everything
//! after it belongs to a call identified by its stream id.

use std::{fmt, io};

use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::{
    config::MAX_FRAME_LEN,
    error::{Error, Status},
};

/// Calls the server exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// `EmptyCall(Empty) -> Empty`, the canary
    EmptyCall,
    /// `SayHello(HelloRequest) -> HelloReply`
    SayHello,
    /// `Periodic(stream HelloRequest) -> stream HelloReply`
    Periodic,
    /// `Syslog(stream LogEntry) -> stream Empty`
    Syslog,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = match self {
            Method::EmptyCall => "/greeter.Greeter/EmptyCall",
            Method::SayHello => "/greeter.Greeter/SayHello",
            Method::Periodic => "/greeter.Greeter/Periodic",
            Method::Syslog => "/greeter.Greeter/Syslog",
        };
        f.write_str(path)
    }
}

/// Ordered key/value pairs attached to a call, keys are lowercase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.0.push((key.as_ref().to_ascii_lowercase(), value.into()));
    }

    pub fn with(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// All values stored under `key`, in insertion order
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// First value stored under `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Unit of transmission on a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Server accepted the client's certificate identity
    Admitted,
    /// Server refused the client's certificate identity and is closing
    Rejected { identity: String },
    /// Client starts a call
    Open {
        stream_id: u32,
        method:    Method,
        metadata:  Metadata,
    },
    /// Response headers for a call
    Headers { stream_id: u32, metadata: Metadata },
    /// One encoded message of a call
    Message { stream_id: u32, payload: Vec<u8> },
    /// Sender finished its direction of the call
    CloseSend { stream_id: u32 },
    /// Server finished the call
    Status { stream_id: u32, status: Status },
}

impl Frame {
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Frame::Admitted | Frame::Rejected { .. } => None,
            Frame::Open { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Message { stream_id, .. }
            | Frame::CloseSend { stream_id }
            | Frame::Status { stream_id, .. } => Some(*stream_id),
        }
    }
}

/// Encodes a call payload
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, Error> {
    Ok(bincode::serialize(msg)?)
}

/// Decodes a call payload
pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, Error> {
    Ok(bincode::deserialize(payload)?)
}

/// Length-delimited bincode codec for [`Frame`]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .little_endian()
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        Self { inner }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        let serialized =
            bincode::serialize(&frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(serialized), dst)
    }
}

/// Writes exactly one frame, without any read-ahead or buffering
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let serialized = bincode::serialize(frame)?;
    let len = u32::try_from(serialized.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| Error::Codec(format!("frame too large: {} bytes", serialized.len())))?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&serialized).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly one frame, consuming no bytes beyond it
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, Error>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::Codec(format!("frame too large: {len} bytes")));
    }

    let mut msg_buf = vec![0u8; len];
    reader.read_exact(&mut msg_buf).await?;
    Ok(bincode::deserialize(&msg_buf)?)
}
