//! Multiplexed calls over one admitted session.
//!
//! Each connection runs exactly one reader task and one writer task. The
//! writer owns the write half, so frames from every call are serialized
//! through a single channel and the transport is shut down exactly once. The
//! reader routes frames to per-stream channels by stream id; a full stream
//! channel stalls the reader, which in turn pushes back on the peer.
//!
//! Any read or write failure condemns the whole connection: the shared
//! [`CancellationToken`] fires, every open call observes the failure and
//! [`MuxConnection::failure`] reports why.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::{
    error::{Code, Error, Status},
    wire::{decode_message, encode_message, Frame, FrameCodec, Metadata, Method},
};

/// Frames buffered per stream before the reader waits for the consumer
const STREAM_BUFFER: usize = 100;

/// Frames buffered in front of the writer task
const WRITE_BUFFER: usize = 128;

/// Upper bound for flushing queued frames once the connection closes
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    outbound:       mpsc::Sender<Frame>,
    streams:        Mutex<HashMap<u32, mpsc::Sender<Frame>>>,
    next_stream_id: AtomicU32,
    cancel:         CancellationToken,
    failure:        Mutex<Option<Status>>,
}

impl Shared {
    /// Records the first failure and condemns the connection
    fn fail(&self, status: Status) {
        {
            let mut failure = lock(&self.failure);
            if failure.is_none() && !self.cancel.is_cancelled() {
                tracing::debug!(reason = %status, "connection failed");
                *failure = Some(status);
            }
        }
        self.cancel.cancel();
    }

    fn failure(&self) -> Option<Status> {
        lock(&self.failure).clone()
    }

    /// Error reported to calls on a connection that is gone
    fn disconnect_error(&self) -> Error {
        match self.failure() {
            Some(status) => Error::Stream(status),
            None => Error::Cancelled,
        }
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(self.disconnect_error());
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.disconnect_error()),
            sent = self.outbound.send(frame) => sent.map_err(|_| self.disconnect_error()),
        }
    }

    fn register(&self, stream_id: u32) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        lock(&self.streams).insert(stream_id, tx);
        rx
    }

    fn unregister(&self, stream_id: u32) {
        lock(&self.streams).remove(&stream_id);
    }
}

/// One multiplexed session, cheap to clone
#[derive(Clone)]
pub struct MuxConnection {
    shared: Arc<Shared>,
}

impl MuxConnection {
    /// Starts the calling side of a session
    pub fn client<IO>(io: IO, cancel: CancellationToken) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(io, cancel, None)
    }

    /// Starts the serving side of a session. Calls opened by the peer arrive
    /// on the returned receiver, which closes when the session ends.
    pub fn server<IO>(io: IO, cancel: CancellationToken) -> (Self, mpsc::Receiver<IncomingCall>)
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (incoming_tx, incoming_rx) = mpsc::channel(STREAM_BUFFER);
        (Self::start(io, cancel, Some(incoming_tx)), incoming_rx)
    }

    fn start<IO>(
        io: IO,
        cancel: CancellationToken,
        incoming: Option<mpsc::Sender<IncomingCall>>,
    ) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (outbound, frames) = mpsc::channel(WRITE_BUFFER);

        let shared = Arc::new(Shared {
            outbound,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(1),
            cancel,
            failure: Mutex::new(None),
        });

        tokio::spawn(write_loop(
            FramedWrite::new(write_half, FrameCodec::new()),
            frames,
            Arc::clone(&shared),
        ));
        tokio::spawn(read_loop(
            FramedRead::new(read_half, FrameCodec::new()),
            Arc::clone(&shared),
            incoming,
        ));

        Self { shared }
    }

    /// Opens a call and returns its two halves
    pub async fn open(
        &self,
        method: Method,
        metadata: Metadata,
    ) -> Result<(CallSender, CallReceiver), Error> {
        if self.shared.cancel.is_cancelled() {
            return Err(self.shared.disconnect_error());
        }

        let stream_id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let frames = self.shared.register(stream_id);
        let open = Frame::Open {
            stream_id,
            method,
            metadata,
        };
        if let Err(e) = self.shared.send_frame(open).await {
            self.shared.unregister(stream_id);
            return Err(e);
        }
        tracing::debug!(stream_id, %method, "call opened");

        Ok((
            CallSender::new(Arc::clone(&self.shared), stream_id),
            CallReceiver::new(Arc::clone(&self.shared), frames),
        ))
    }

    /// Sends one request and waits for exactly one response
    pub async fn unary<Req, Resp>(
        &self,
        method: Method,
        metadata: Metadata,
        request: &Req,
    ) -> Result<(Metadata, Resp), Error>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let (sender, mut receiver) = self.open(method, metadata).await?;
        sender.send(request).await?;
        sender.close_send();

        let response = receiver
            .recv::<Resp>()
            .await?
            .ok_or_else(|| Error::Status(Status::internal("call finished without a response")))?;
        if receiver.recv::<Resp>().await?.is_some() {
            return Err(Error::Status(Status::internal("unary call returned more than one response")));
        }
        Ok((receiver.headers().clone(), response))
    }

    /// Closes the connection. Idempotent.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Why the connection died, `None` while open or after [`close`](Self::close)
    pub fn failure(&self) -> Option<Error> {
        self.shared.failure().map(Error::Stream)
    }

    /// Token fired when the connection closes for any reason
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }
}

/// Writing half of a call
#[derive(Clone)]
pub struct CallSender {
    shared:    Arc<Shared>,
    stream_id: u32,
}

impl CallSender {
    fn new(shared: Arc<Shared>, stream_id: u32) -> Self {
        Self { shared, stream_id }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Sends one message, waiting for room in the connection's write buffer
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<(), Error> {
        let payload = encode_message(message)?;
        self.shared
            .send_frame(Frame::Message {
                stream_id: self.stream_id,
                payload,
            })
            .await
    }

    pub async fn send_headers(&self, metadata: Metadata) -> Result<(), Error> {
        self.shared
            .send_frame(Frame::Headers {
                stream_id: self.stream_id,
                metadata,
            })
            .await
    }

    /// Signals that no more messages follow. Best effort: a full write
    /// buffer or a dead connection drops the signal.
    pub fn close_send(&self) {
        let frame = Frame::CloseSend {
            stream_id: self.stream_id,
        };
        if self.shared.outbound.try_send(frame).is_err() {
            tracing::debug!(stream_id = self.stream_id, "close-send not delivered");
        }
    }

    /// Ends the call with `status` (serving side)
    pub async fn finish(&self, status: Status) -> Result<(), Error> {
        let result = self
            .shared
            .send_frame(Frame::Status {
                stream_id: self.stream_id,
                status,
            })
            .await;
        self.shared.unregister(self.stream_id);
        result
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

/// Reading half of a call
pub struct CallReceiver {
    shared:   Arc<Shared>,
    frames:   mpsc::Receiver<Frame>,
    headers:  Metadata,
    finished: bool,
}

impl CallReceiver {
    fn new(shared: Arc<Shared>, frames: mpsc::Receiver<Frame>) -> Self {
        Self {
            shared,
            frames,
            headers: Metadata::new(),
            finished: false,
        }
    }

    /// Next message of the call.
    ///
    /// `Ok(None)` means the peer finished cleanly. A non-OK status or a dead
    /// connection is an error.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, Error> {
        while !self.finished {
            // Frames already buffered are delivered before the closure is reported
            let next = tokio::select! {
                biased;
                frame = self.frames.recv() => frame,
                _ = self.shared.cancel.cancelled() => None,
            };
            match next {
                Some(Frame::Message { payload, .. }) => return decode_message(&payload).map(Some),
                Some(Frame::Headers { metadata, .. }) => {
                    for (key, value) in metadata.iter() {
                        self.headers.insert(key, value);
                    }
                }
                Some(Frame::CloseSend { .. }) => self.finished = true,
                Some(Frame::Status { status, .. }) => {
                    self.finished = true;
                    if !status.is_ok() {
                        return Err(Error::from_status(status));
                    }
                }
                Some(other) => tracing::warn!(frame = ?other, "unexpected frame on call"),
                None => {
                    self.finished = true;
                    return Err(self.shared.disconnect_error());
                }
            }
        }
        Ok(None)
    }

    /// Headers received so far
    pub fn headers(&self) -> &Metadata {
        &self.headers
    }
}

/// A call opened by the peer
pub struct IncomingCall {
    pub stream_id: u32,
    pub method:    Method,
    pub metadata:  Metadata,
    pub sender:    CallSender,
    pub receiver:  CallReceiver,
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut frames: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    shared.fail(Status::unavailable(format!("write failed: {e}")));
                    break;
                }
            }
            _ = shared.cancel.cancelled() => break,
        }
    }

    // Flush whatever callers queued before the close, then shut down once
    let drain = async {
        while let Ok(frame) = frames.try_recv() {
            sink.feed(frame).await?;
        }
        sink.close().await
    };
    match tokio::time::timeout(CLOSE_TIMEOUT, drain).await {
        Ok(Ok(())) => tracing::debug!("transport shut down"),
        Ok(Err(e)) => tracing::debug!(error = %e, "transport shutdown failed"),
        Err(_) => tracing::debug!("transport shutdown timed out"),
    }
    shared.cancel.cancel();
}

async fn read_loop<R>(
    mut frames: FramedRead<R, FrameCodec>,
    shared: Arc<Shared>,
    incoming: Option<mpsc::Sender<IncomingCall>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => route(&shared, frame, incoming.as_ref()).await,
            Some(Err(e)) => {
                shared.fail(Status::unavailable(format!("read failed: {e}")));
                break;
            }
            None => {
                shared.fail(Status::unavailable("connection closed by peer"));
                break;
            }
        }
    }

    shared.cancel.cancel();
    // Dropping the senders wakes every pending receiver
    lock(&shared.streams).clear();
}

async fn route(shared: &Arc<Shared>, frame: Frame, incoming: Option<&mpsc::Sender<IncomingCall>>) {
    match frame {
        Frame::Open {
            stream_id,
            method,
            metadata,
        } => {
            let Some(incoming) = incoming else {
                tracing::warn!(stream_id, "peer tried to open a call on a client session");
                return;
            };
            let frames = shared.register(stream_id);
            let call = IncomingCall {
                stream_id,
                method,
                metadata,
                sender: CallSender::new(Arc::clone(shared), stream_id),
                receiver: CallReceiver::new(Arc::clone(shared), frames),
            };
            if incoming.send(call).await.is_err() {
                shared.unregister(stream_id);
                let refused = Frame::Status {
                    stream_id,
                    status: Status::new(Code::Unavailable, "not accepting calls"),
                };
                let _ = shared.outbound.try_send(refused);
            }
        }
        Frame::Admitted | Frame::Rejected { .. } => {
            tracing::warn!(frame = ?frame, "admission verdict inside an established session");
        }
        frame => {
            let Some(stream_id) = frame.stream_id() else { return };
            let is_status = matches!(frame, Frame::Status { .. });
            let target = lock(&shared.streams).get(&stream_id).cloned();
            match target {
                Some(target) => {
                    // A consumer that stopped draining must not pin the reader
                    // past the connection's end
                    let delivered = tokio::select! {
                        biased;
                        _ = shared.cancel.cancelled() => return,
                        sent = target.send(frame) => sent.is_ok(),
                    };
                    if !delivered || is_status {
                        shared.unregister(stream_id);
                    }
                }
                None => tracing::debug!(stream_id, "frame for unknown stream dropped"),
            }
        }
    }
}
