//! Lifecycle of the client's connection to the server.
//!
//! [`ConnectionManager::connect`] dials with backoff until it either holds an
//! [`Connection`] that passed the canary call or hits a failure retrying
//! cannot fix. What to do when an established connection later dies is left
//! to the caller.

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use edgelink_common::{
    config::ALPN_PROTOCOL,
    error::{Error, Status},
    message::{HelloReply, HelloRequest, LogEntry},
    mux::MuxConnection,
    queue::{InboundQueue, OutboundQueue, Queue},
    tls::ClientCredentials,
    wire::Metadata,
    Identity,
};
use tokio::{net::TcpStream, sync::watch};
use tokio_util::sync::CancellationToken;

use crate::{client::ClientConfig, greeter::GreeterClient, streams::InFlight};

/// Lifecycle of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Dialing,
    Handshaking,
    /// TLS established and the server admitted our identity
    Authorized,
    /// The canary call succeeded
    Active,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Whether calls may be issued. Only the canary runs while `Authorized`.
    pub fn is_ready(self) -> bool {
        self == ConnectionState::Active
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Dialing => "dialing",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Authorized => "authorized",
            ConnectionState::Active => "active",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Fail immediately with `UNAVAILABLE` instead of waiting for the
    /// connection to become ready
    pub fail_fast: bool,
    pub metadata:  Metadata,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

/// Queues linking producers and consumers to the logical streams.
///
/// They belong to the manager, not to a connection, so items survive a
/// reconnect.
#[derive(Clone)]
pub struct Queues {
    /// Heartbeat requests sent ahead of generated ones
    pub heartbeat_out:       OutboundQueue<HelloRequest>,
    /// Replies received on the heartbeat stream
    pub heartbeat_in:        InboundQueue<HelloReply>,
    /// Log records to forward
    pub log_out:             OutboundQueue<LogEntry>,
    /// Queued heartbeat whose send was cut short by a lost connection
    pub heartbeat_in_flight: InFlight<HelloRequest>,
    /// Log record whose send was cut short by a lost connection
    pub log_in_flight:       InFlight<LogEntry>,
}

impl Queues {
    pub fn new(capacity: usize) -> Self {
        Self {
            heartbeat_out:       Queue::new(capacity),
            heartbeat_in:        Queue::new(capacity),
            log_out:             Queue::new(capacity),
            heartbeat_in_flight: InFlight::new(),
            log_in_flight:       InFlight::new(),
        }
    }

    pub fn close(&self) {
        self.heartbeat_out.close();
        self.heartbeat_in.close();
        self.log_out.close();
    }
}

/// An established, admitted connection
#[derive(Clone)]
pub struct Connection {
    mux:             MuxConnection,
    state:           Arc<watch::Sender<ConnectionState>>,
    remote_addr:     Option<SocketAddr>,
    server_identity: Identity,
    user_agent:      String,
}

impl Connection {
    pub(crate) fn new(
        mux: MuxConnection,
        remote_addr: Option<SocketAddr>,
        server_identity: Identity,
        user_agent: String,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Authorized);
        let state = Arc::new(state);

        // Publish the terminal state once the session ends
        {
            let mux = mux.clone();
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                mux.cancellation().cancelled().await;
                let terminal = if mux.failure().is_some() {
                    ConnectionState::Failed
                } else {
                    ConnectionState::Closed
                };
                state.send_replace(terminal);
            });
        }

        Self {
            mux,
            state,
            remote_addr,
            server_identity,
            user_agent,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watches lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn mark_active(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Authorized {
                *state = ConnectionState::Active;
                true
            } else {
                false
            }
        });
    }

    /// Waits until calls may be issued.
    ///
    /// With `fail_fast` a connection that is not ready yet fails immediately.
    pub async fn ready(&self, fail_fast: bool) -> Result<(), Error> {
        let mut state = self.subscribe();
        loop {
            let current = *state.borrow_and_update();
            if current.is_ready() {
                return Ok(());
            }
            if current.is_terminal() {
                return Err(self.disconnect_error());
            }
            if fail_fast {
                return Err(Error::from_status(Status::unavailable(format!(
                    "connection is {current}"
                ))));
            }
            if state.changed().await.is_err() {
                return Err(self.disconnect_error());
            }
        }
    }

    fn disconnect_error(&self) -> Error {
        self.failure().unwrap_or(Error::Cancelled)
    }

    /// Closes the connection and stops every logical stream. Idempotent.
    pub fn close(&self) {
        self.mux.close();
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Why the connection died, `None` while open or after [`close`](Self::close)
    pub fn failure(&self) -> Option<Error> {
        self.mux.failure()
    }

    /// Fires when the connection ends for any reason
    pub fn cancellation(&self) -> CancellationToken {
        self.mux.cancellation()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn server_identity(&self) -> &Identity {
        &self.server_identity
    }

    pub fn alpn_protocol(&self) -> &'static [u8] {
        ALPN_PROTOCOL
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub(crate) fn mux(&self) -> &MuxConnection {
        &self.mux
    }
}

/// Dials the server and owns the queues shared by every connection
pub struct ConnectionManager {
    config:      ClientConfig,
    credentials: ClientCredentials,
    queues:      Queues,
    closed:      CancellationToken,
    current:     Mutex<Option<Connection>>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, credentials: ClientCredentials) -> Self {
        let queues = Queues::new(config.queue_capacity);
        Self {
            config,
            credentials,
            queues,
            closed: CancellationToken::new(),
            current: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    /// The most recently established connection
    pub fn current(&self) -> Option<Connection> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Dials until a connection passes the canary call.
    ///
    /// Transient failures are retried with backoff. Rejection, local
    /// configuration errors and cancellation are returned right away.
    pub async fn connect(&self) -> Result<Connection, Error> {
        let mut backoff = self.config.backoff.backoff();

        loop {
            if self.closed.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let error = match self.dial_once().await {
                Ok(connection) => {
                    *self.current.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(connection.clone());
                    return Ok(connection);
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                tracing::error!(address = %self.config.address, error = %error, "dial failed, not retrying");
                return Err(error);
            }

            let Some(delay) = backoff.next() else {
                tracing::error!(
                    address = %self.config.address,
                    attempts = backoff.attempts(),
                    error = %error,
                    "dial failed after max attempts"
                );
                return Err(error);
            };

            tracing::warn!(
                address = %self.config.address,
                attempt = backoff.attempts(),
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "dial failed, retrying"
            );

            tokio::select! {
                _ = self.closed.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn dial_once(&self) -> Result<Connection, Error> {
        let cancel = self.closed.child_token();
        let mut state = ConnectionState::Dialing;
        tracing::debug!(address = %self.config.address, state = %state, "dialing");

        let dial = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.address.as_str()),
        );
        let tcp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            dialed = dial => {
                dialed.map_err(|_| Error::Io(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))??
            }
        };
        let _ = tcp.set_nodelay(true);
        let remote_addr = tcp.peer_addr().ok();

        state = ConnectionState::Handshaking;
        tracing::debug!(remote = ?remote_addr, state = %state, "connected, starting TLS");
        let (session, server_identity) = self
            .credentials
            .client_handshake(&self.config.server_name, tcp, &cancel)
            .await?;

        let connection = Connection::new(
            MuxConnection::client(session, cancel),
            remote_addr,
            server_identity,
            self.config.user_agent.clone(),
        );
        tracing::debug!(server = %connection.server_identity(), state = %connection.state(), "admitted");

        // The canary forces the whole path before any stream is opened
        let canary = GreeterClient::new(connection.clone()).canary().await;
        if let Err(e) = canary {
            tracing::warn!(error = %e, "canary call failed, tearing down connection");
            connection.close();
            return Err(e);
        }

        connection.mark_active();
        tracing::info!(
            remote = ?remote_addr,
            server = %connection.server_identity(),
            "connection active"
        );
        Ok(connection)
    }

    /// Stops dialing, closes every connection and every queue. Idempotent.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::info!("closing connection manager");
        }
        self.closed.cancel();
        self.queues.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
