//! Responder side of the greeter calls.
//!
//! Handlers never see TLS state. The admitted identity reaches them through
//! [`CallContext::peer`], filled in once per connection by the server loop.

use std::{net::SocketAddr, time::Duration};

use chrono::{SecondsFormat, Utc};
use edgelink_common::{
    error::{Code, Error, Status},
    message::{Empty, HelloReply, HelloRequest, LogEntry},
    mux::{CallReceiver, CallSender, IncomingCall},
    wire::{Metadata, Method},
    Identity,
};
use serde::de::DeserializeOwned;
use tokio::{sync::mpsc, task::JoinSet, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default spacing of `Periodic` replies
pub const DEFAULT_PERIODIC_INTERVAL: Duration = Duration::from_millis(100);

/// The admitted peer of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub identity:    Identity,
    pub remote_addr: Option<SocketAddr>,
}

/// A log record received on the `Syslog` call, tagged with its sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedLog {
    pub identity: Identity,
    pub entry:    LogEntry,
}

/// Per-call state handed to a handler
#[derive(Debug, Clone)]
pub struct CallContext {
    pub peer:     Option<PeerInfo>,
    pub metadata: Metadata,
    pub cancel:   CancellationToken,
}

impl CallContext {
    fn peer(&self) -> Result<&PeerInfo, Error> {
        self.peer.as_ref().ok_or_else(|| {
            let err = Error::InvalidPeer("no authorized identity in call context".into());
            tracing::error!(error = %err, "call reached a handler without a peer identity");
            err
        })
    }
}

/// The greeter service
#[derive(Clone)]
pub struct Greeter {
    periodic_interval: Duration,
    log_sink:          Option<mpsc::Sender<ForwardedLog>>,
}

impl Greeter {
    pub fn new(periodic_interval: Duration) -> Self {
        Self {
            periodic_interval,
            log_sink: None,
        }
    }

    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = interval;
        self
    }

    /// Forwards every received [`LogEntry`] to `sink`
    pub fn with_log_sink(mut self, sink: mpsc::Sender<ForwardedLog>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Canary call. Echoes every `user-agent` value back as a `ua` header.
    pub fn empty_call(&self, ctx: &CallContext, _request: Empty) -> Result<(Metadata, Empty), Error> {
        let agents: Vec<&str> = ctx.metadata.get_all("user-agent").collect();
        if agents.is_empty() {
            return Err(Error::Status(Status::data_loss("missing expected user-agent")));
        }
        let headers = agents
            .into_iter()
            .fold(Metadata::new(), |headers, agent| headers.with("ua", agent));
        Ok((headers, Empty))
    }

    pub fn say_hello(&self, ctx: &CallContext, request: HelloRequest) -> Result<HelloReply, Error> {
        let peer = ctx.peer()?;
        tracing::info!(identity = %peer.identity, remote = ?peer.remote_addr, name = %request.name, "hello");
        Ok(HelloReply {
            message: format!("Hello {}", peer.identity),
        })
    }

    /// Sends a timestamped reply every interval while logging what the client
    /// sends. Ends on cancellation or the first failure in either direction.
    pub async fn periodic(
        &self,
        ctx: &CallContext,
        sender: &CallSender,
        receiver: CallReceiver,
    ) -> Result<(), Error> {
        let identity = ctx.peer()?.identity.clone();

        let mut receiving = JoinSet::new();
        receiving.spawn(log_heartbeats(receiver, identity.clone()));

        let mut ticker = tokio::time::interval(self.periodic_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
                Some(joined) = receiving.join_next(), if !receiving.is_empty() => {
                    match joined {
                        Ok(Ok(())) => tracing::debug!(identity = %identity, "client finished sending heartbeats"),
                        Ok(Err(e)) => return Err(e),
                        Err(e) => return Err(Error::Status(Status::internal(format!("heartbeat receiver failed: {e}")))),
                    }
                }
                _ = ticker.tick() => {
                    let reply = HelloReply {
                        message: format!(
                            "{identity}: {}",
                            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
                        ),
                    };
                    sender.send(&reply).await?;
                }
            }
        }
    }

    /// Drains forwarded log records until the client closes its side
    pub async fn syslog(&self, ctx: &CallContext, mut receiver: CallReceiver) -> Result<(), Error> {
        let identity = ctx.peer()?.identity.clone();

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
                next = receiver.recv::<LogEntry>() => next?,
            };
            let Some(entry) = next else { return Ok(()) };

            log_entry(&identity, &entry);
            if let Some(sink) = &self.log_sink {
                let forwarded = ForwardedLog {
                    identity: identity.clone(),
                    entry,
                };
                if sink.send(forwarded).await.is_err() {
                    tracing::debug!("log sink closed, dropping forwarded entry");
                }
            }
        }
    }

    /// Runs one incoming call to completion and sends its final status.
    ///
    /// Unary failures are reported to the caller only. A failed streaming call
    /// is returned so the connection can drain.
    pub async fn dispatch(&self, ctx: CallContext, call: IncomingCall) -> Result<(), Error> {
        let IncomingCall {
            stream_id,
            method,
            sender,
            mut receiver,
            ..
        } = call;
        tracing::debug!(stream_id, %method, "call started");

        let (result, streaming) = match method {
            Method::EmptyCall => {
                let outcome = async {
                    let request = read_request::<Empty>(&mut receiver).await?;
                    let (headers, reply) = self.empty_call(&ctx, request)?;
                    sender.send_headers(headers).await?;
                    sender.send(&reply).await
                };
                (outcome.await, false)
            }
            Method::SayHello => {
                let outcome = async {
                    let request = read_request::<HelloRequest>(&mut receiver).await?;
                    let reply = self.say_hello(&ctx, request)?;
                    sender.send(&reply).await
                };
                (outcome.await, false)
            }
            Method::Periodic => (self.periodic(&ctx, &sender, receiver).await, true),
            Method::Syslog => (self.syslog(&ctx, receiver).await, true),
        };

        match result {
            Ok(()) => {
                tracing::debug!(stream_id, %method, "call finished");
                sender.finish(Status::ok()).await
            }
            Err(e) => {
                match &e {
                    Error::Cancelled | Error::Stream(_) => {
                        tracing::debug!(stream_id, %method, error = %e, "call ended with its connection");
                    }
                    Error::InvalidPeer(_) => tracing::error!(stream_id, %method, error = %e, "call failed"),
                    _ => tracing::warn!(stream_id, %method, error = %e, "call failed"),
                }
                // The peer may already be gone
                let _ = sender.finish(e.to_status()).await;
                if streaming {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl Default for Greeter {
    fn default() -> Self {
        Self::new(DEFAULT_PERIODIC_INTERVAL)
    }
}

async fn read_request<T: DeserializeOwned>(receiver: &mut CallReceiver) -> Result<T, Error> {
    receiver
        .recv::<T>()
        .await?
        .ok_or_else(|| Error::Status(Status::new(Code::InvalidArgument, "missing request message")))
}

async fn log_heartbeats(mut receiver: CallReceiver, identity: Identity) -> Result<(), Error> {
    while let Some(request) = receiver.recv::<HelloRequest>().await? {
        tracing::info!(identity = %identity, name = %request.name, "heartbeat");
    }
    Ok(())
}

fn log_entry(identity: &Identity, entry: &LogEntry) {
    let timestamp = entry.timestamp.map(|ts| ts.to_rfc3339());
    match entry.known_severity() {
        Some(0..=3) => {
            tracing::error!(identity = %identity, app = %entry.app_name, severity = entry.severity, timestamp = ?timestamp, "{}", entry.text)
        }
        Some(4) => {
            tracing::warn!(identity = %identity, app = %entry.app_name, severity = entry.severity, timestamp = ?timestamp, "{}", entry.text)
        }
        Some(7) => {
            tracing::debug!(identity = %identity, app = %entry.app_name, severity = entry.severity, timestamp = ?timestamp, "{}", entry.text)
        }
        // Notice, informational and unknown severities
        _ => {
            tracing::info!(identity = %identity, app = %entry.app_name, severity = entry.severity, timestamp = ?timestamp, "{}", entry.text)
        }
    }
}
