//! Send and receive loops for the two logical streams of a connection.
//!
//! Each loop owns one direction of one call. Every loop watches the same
//! cancellation token; on cancellation a send loop half-closes its call and
//! returns, a receive loop simply returns.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use edgelink_common::{
    error::{Error, Status},
    message::{Empty, HelloReply, HelloRequest, LogEntry},
    mux::{CallReceiver, CallSender},
    queue::{InboundQueue, OutboundQueue},
};
use tokio::{task::JoinSet, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{CallOptions, Connection, Queues},
    greeter::GreeterClient,
};

/// Default spacing of heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// The item a send loop took off its queue and has not handed to the
/// connection yet.
///
/// Owned by the queues rather than the connection, so a send interrupted by
/// a lost connection is retried first on the next one.
pub struct InFlight<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for InFlight<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for InFlight<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T: Clone> InFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn hold(&self, item: T) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(item);
    }

    fn peek(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn release(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

/// Sends one heartbeat per tick. An interrupted request goes first, then a
/// queued one, then a generated one.
pub async fn heartbeat_send_loop(
    sender: CallSender,
    queue: OutboundQueue<HelloRequest>,
    in_flight: InFlight<HelloRequest>,
    interval: Duration,
    name: String,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let request = match in_flight.peek() {
            Some(request) => request,
            None => match queue.try_pop() {
                Some(request) => {
                    in_flight.hold(request.clone());
                    request
                }
                None => HelloRequest::new(format!("{name} {}", Utc::now().timestamp())),
            },
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = sender.send(&request) => sent?,
        }
        in_flight.release();
        tracing::trace!(stream_id = sender.stream_id(), name = %request.name, "heartbeat sent");
    }

    sender.close_send();
    Ok(())
}

/// Forwards log records one per wake-up, in queue order, starting with the
/// record an earlier connection failed to send.
///
/// Half-closes the call once the queue is closed and drained.
pub async fn log_send_loop(
    sender: CallSender,
    queue: OutboundQueue<LogEntry>,
    in_flight: InFlight<LogEntry>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    loop {
        let entry = match in_flight.peek() {
            Some(entry) => entry,
            None => {
                let entry = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    entry = queue.pop() => entry,
                };
                let Some(entry) = entry else {
                    tracing::debug!(stream_id = sender.stream_id(), "log queue closed");
                    break;
                };
                in_flight.hold(entry.clone());
                entry
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = sender.send(&entry) => sent?,
        }
        in_flight.release();
    }

    sender.close_send();
    Ok(())
}

/// Pushes every heartbeat reply into `queue` in arrival order, waiting while
/// it is full. Ends cleanly when the server finishes the call.
pub async fn receive_loop(
    mut receiver: CallReceiver,
    queue: InboundQueue<HelloReply>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    loop {
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            reply = receiver.recv::<HelloReply>() => reply?,
        };
        let Some(reply) = reply else { return Ok(()) };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            pushed = queue.push(reply) => pushed?,
        }
    }
}

/// Drains the log call until the server finishes it
pub async fn log_receive_loop(mut receiver: CallReceiver, cancel: CancellationToken) -> Result<(), Error> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            next = receiver.recv::<Empty>() => next?,
        };
        if next.is_none() {
            return Ok(());
        }
    }
}

/// Runs the heartbeat and log streams of one connection
#[derive(Debug, Clone)]
pub struct StreamMux {
    pub heartbeat_interval: Duration,
    /// Prefix of generated heartbeat names
    pub name:               String,
}

impl StreamMux {
    pub fn new(name: impl Into<String>, heartbeat_interval: Duration) -> Self {
        Self {
            heartbeat_interval,
            name: name.into(),
        }
    }

    /// Opens both streams and runs their loops until the connection ends.
    ///
    /// The first failing loop closes the connection, which stops the rest.
    /// Returns `Ok(())` when the connection was closed on purpose.
    pub async fn run(&self, connection: &Connection, queues: &Queues) -> Result<(), Error> {
        let greeter = GreeterClient::new(connection.clone());
        let (heartbeat_tx, heartbeat_rx) = greeter.periodic(CallOptions::new()).await?;
        let (log_tx, log_rx) = greeter.syslog(CallOptions::new()).await?;
        let cancel = connection.cancellation();

        let mut loops = JoinSet::new();
        loops.spawn(heartbeat_send_loop(
            heartbeat_tx,
            queues.heartbeat_out.clone(),
            queues.heartbeat_in_flight.clone(),
            self.heartbeat_interval,
            self.name.clone(),
            cancel.clone(),
        ));
        loops.spawn(receive_loop(heartbeat_rx, queues.heartbeat_in.clone(), cancel.clone()));
        loops.spawn(log_send_loop(
            log_tx,
            queues.log_out.clone(),
            queues.log_in_flight.clone(),
            cancel.clone(),
        ));
        loops.spawn(log_receive_loop(log_rx, cancel));
        tracing::debug!(server = %connection.server_identity(), "streams running");

        let mut first_error = None;
        while let Some(joined) = loops.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(Error::Status(Status::internal(format!("stream task panicked: {e}"))))
            });
            if let Err(e) = outcome {
                if first_error.is_none() {
                    tracing::warn!(error = %e, "stream failed, closing connection");
                    connection.close();
                    first_error = Some(e);
                }
            }
        }

        if let Some(failure) = connection.failure() {
            return Err(failure);
        }
        match first_error {
            Some(Error::Cancelled) | None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use edgelink_common::{
        mux::{IncomingCall, MuxConnection},
        queue::Queue,
        wire::{Metadata, Method},
    };
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    use super::*;

    fn session() -> (MuxConnection, mpsc::Receiver<IncomingCall>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = MuxConnection::client(client_io, CancellationToken::new());
        let (_server, incoming) = MuxConnection::server(server_io, CancellationToken::new());
        (client, incoming)
    }

    async fn received<T: serde::de::DeserializeOwned>(call: &mut IncomingCall) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = call.receiver.recv::<T>().await.unwrap() {
            items.push(item);
        }
        items
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_follow_the_interval() {
        let (client, mut incoming) = session();
        let (sender, _receiver) = client.open(Method::Periodic, Metadata::new()).await.unwrap();
        let mut call = incoming.recv().await.unwrap();

        let cancel = CancellationToken::new();
        let interval = Duration::from_millis(100);
        let sending = tokio::spawn(heartbeat_send_loop(
            sender,
            Queue::new(8),
            InFlight::new(),
            interval,
            "edge-01".to_string(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        sending.await.unwrap().unwrap();

        let heartbeats: Vec<HelloRequest> = received(&mut call).await;
        assert!((9..=11).contains(&heartbeats.len()), "got {} heartbeats", heartbeats.len());
        assert!(heartbeats.iter().all(|h| h.name.starts_with("edge-01 ")));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_heartbeat_goes_first() {
        let (client, mut incoming) = session();
        let (sender, _receiver) = client.open(Method::Periodic, Metadata::new()).await.unwrap();
        let mut call = incoming.recv().await.unwrap();

        let queue = Queue::new(8);
        queue.push(HelloRequest::new("ping-1")).await.unwrap();
        let cancel = CancellationToken::new();
        let sending = tokio::spawn(heartbeat_send_loop(
            sender,
            queue.clone(),
            InFlight::new(),
            Duration::from_millis(100),
            "edge-01".to_string(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        sending.await.unwrap().unwrap();

        let heartbeats: Vec<HelloRequest> = received(&mut call).await;
        assert_eq!(heartbeats[0].name, "ping-1");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn replies_land_in_the_inbound_queue() {
        let (client, mut incoming) = session();
        let (_sender, receiver) = client.open(Method::Periodic, Metadata::new()).await.unwrap();
        let call = incoming.recv().await.unwrap();

        for i in 0..3 {
            call.sender
                .send(&HelloReply {
                    message: format!("reply {i}"),
                })
                .await
                .unwrap();
        }
        call.sender.finish(Status::ok()).await.unwrap();

        let queue = Queue::new(8);
        receive_loop(receiver, queue.clone(), CancellationToken::new())
            .await
            .unwrap();
        for i in 0..3 {
            assert_eq!(queue.try_pop().unwrap().message, format!("reply {i}"));
        }
    }

    #[tokio::test]
    async fn cancelled_log_loop_half_closes() {
        let (client, mut incoming) = session();
        let (sender, _receiver) = client.open(Method::Syslog, Metadata::new()).await.unwrap();
        let mut call = incoming.recv().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        log_send_loop(sender, Queue::new(4), InFlight::new(), cancel)
            .await
            .unwrap();

        let entries: Vec<LogEntry> = received(&mut call).await;
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn unsent_log_entry_survives_a_lost_connection() {
        let queue = Queue::new(4);
        let in_flight = InFlight::new();
        let entry = LogEntry::new(3, "auth", "login failed");
        queue.push(entry.clone()).await.unwrap();

        let (lost, _incoming) = session();
        let (sender, _receiver) = lost.open(Method::Syslog, Metadata::new()).await.unwrap();
        lost.close();
        let outcome = log_send_loop(sender, queue.clone(), in_flight.clone(), CancellationToken::new()).await;
        assert!(matches!(outcome, Err(Error::Cancelled)));
        assert!(queue.is_empty());
        assert!(!in_flight.is_empty());

        let (client, mut incoming) = session();
        let (sender, _receiver) = client.open(Method::Syslog, Metadata::new()).await.unwrap();
        let mut call = incoming.recv().await.unwrap();
        queue.push(LogEntry::new(6, "auth", "login ok")).await.unwrap();
        queue.close();
        log_send_loop(sender, queue, in_flight.clone(), CancellationToken::new())
            .await
            .unwrap();

        let entries: Vec<LogEntry> = received(&mut call).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], entry);
        assert_eq!(entries[1].text, "login ok");
        assert!(in_flight.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn log_records_keep_queue_order(count in 1usize..=100) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let texts = runtime.block_on(async move {
                let (client, mut incoming) = session();
                let (sender, _receiver) = client.open(Method::Syslog, Metadata::new()).await.unwrap();
                let mut call = incoming.recv().await.unwrap();

                let queue = Queue::new(100);
                for i in 0..count {
                    queue.push(LogEntry::new(6, "app", i.to_string())).await.unwrap();
                }
                queue.close();
                log_send_loop(sender, queue, InFlight::new(), CancellationToken::new())
                    .await
                    .unwrap();

                let entries: Vec<LogEntry> = received(&mut call).await;
                entries.into_iter().map(|e| e.text).collect::<Vec<_>>()
            });

            let expected: Vec<String> = (0..count).map(|i| i.to_string()).collect();
            prop_assert_eq!(texts, expected);
        }
    }
}
