use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use edgelink_common::{
    error::{Error, Status},
    mux::MuxConnection,
    tls::ServerCredentials,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::mpsc,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::handler::{CallContext, ForwardedLog, Greeter, PeerInfo, DEFAULT_PERIODIC_INTERVAL};

/// Grace period for the remaining calls once a connection starts draining
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Server tuning
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Spacing of `Periodic` replies
    pub periodic_interval: Duration,
    /// How long open calls may keep running after a call failed
    pub drain_timeout:     Duration,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = interval;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            periodic_interval: DEFAULT_PERIODIC_INTERVAL,
            drain_timeout:     DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Lifecycle of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Listening,
    Handshaking,
    Authorizing,
    /// Admitted, with the number of calls in flight
    Active(usize),
    Draining,
    Closed,
    Rejected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Listening => f.write_str("listening"),
            SessionState::Handshaking => f.write_str("handshaking"),
            SessionState::Authorizing => f.write_str("authorizing"),
            SessionState::Active(calls) => write!(f, "active({calls})"),
            SessionState::Draining => f.write_str("draining"),
            SessionState::Closed => f.write_str("closed"),
            SessionState::Rejected => f.write_str("rejected"),
        }
    }
}

fn transition(state: &mut SessionState, next: SessionState) {
    if *state != next {
        tracing::debug!(from = %state, to = %next, "session state");
        *state = next;
    }
}

/// Accepts TLS connections, admits them against the allowlist and serves
/// the greeter calls on each.
#[derive(Clone)]
pub struct EdgeServer {
    credentials: Arc<ServerCredentials>,
    config:      ServerConfig,
    greeter:     Greeter,
}

impl EdgeServer {
    pub fn new(credentials: ServerCredentials) -> Self {
        let config = ServerConfig::default();
        Self {
            credentials: Arc::new(credentials),
            greeter: Greeter::new(config.periodic_interval),
            config,
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.greeter = self.greeter.with_periodic_interval(config.periodic_interval);
        self.config = config;
        self
    }

    /// Receives every log record clients forward over `Syslog`
    pub fn with_log_sink(mut self, sink: mpsc::Sender<ForwardedLog>) -> Self {
        self.greeter = self.greeter.with_log_sink(sink);
        self
    }

    /// Serves connections until the listener fails
    pub async fn run(&self, listener: TcpListener) -> Result<(), Error> {
        self.run_with_shutdown(listener, CancellationToken::new()).await
    }

    /// Serves connections until `shutdown` fires, then closes every open
    /// connection and waits for them to finish.
    pub async fn run_with_shutdown(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        tracing::info!(address = %listener.local_addr()?, "edgelink server listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, remote_addr)) => {
                            tracing::debug!(%remote_addr, "new connection received");
                            let _ = socket.set_nodelay(true);
                            let server = self.clone();
                            let shutdown = shutdown.child_token();
                            connections.spawn(async move {
                                server.serve_connection(socket, Some(remote_addr), shutdown).await
                            });
                        }
                        Err(e) => tracing::error!(error = %e, "accept failed"),
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        tracing::info!(open = connections.len(), "server shutdown signal received, stopping gracefully");
        while connections.join_next().await.is_some() {}
        Ok(())
    }

    /// Runs one connection through handshake, admission and its calls.
    ///
    /// Firing `shutdown` closes the connection. The returned error is the
    /// reason the session ended early, if any.
    pub async fn serve_connection<IO>(
        &self,
        io: IO,
        remote_addr: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) -> Result<(), Error>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let span = tracing::info_span!("connection", id = %Uuid::new_v4(), remote = ?remote_addr);
        let result = self
            .serve(io, remote_addr, shutdown)
            .instrument(span.clone())
            .await;
        span.in_scope(|| {
            match &result {
                Ok(()) => tracing::info!("connection closed"),
                Err(Error::Unauthenticated { identity }) => {
                    tracing::warn!(identity = %identity, "connection rejected");
                }
                Err(e @ (Error::Cancelled | Error::Stream(_))) => {
                    tracing::info!(reason = %e, "client disconnected");
                }
                Err(e) => tracing::error!(error = %e, "connection failed"),
            }
        });
        result
    }

    async fn serve<IO>(
        &self,
        io: IO,
        remote_addr: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) -> Result<(), Error>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut state = SessionState::Listening;

        transition(&mut state, SessionState::Handshaking);
        let (stream, identity) = self.credentials.server_handshake(io).await?;

        transition(&mut state, SessionState::Authorizing);
        let stream = match self.credentials.admit(stream, &identity).await {
            Ok(stream) => stream,
            Err(e) => {
                transition(&mut state, SessionState::Rejected);
                return Err(e);
            }
        };

        let peer = PeerInfo {
            identity,
            remote_addr,
        };
        let (mux, mut incoming) = MuxConnection::server(stream, shutdown);
        let mut calls = JoinSet::new();
        transition(&mut state, SessionState::Active(0));

        let failure = loop {
            tokio::select! {
                call = incoming.recv() => {
                    let Some(call) = call else { break None };
                    let ctx = CallContext {
                        peer:     Some(peer.clone()),
                        metadata: call.metadata.clone(),
                        cancel:   mux.cancellation().child_token(),
                    };
                    let greeter = self.greeter.clone();
                    calls.spawn(async move { greeter.dispatch(ctx, call).await });
                    transition(&mut state, SessionState::Active(calls.len()));
                }
                Some(joined) = calls.join_next(), if !calls.is_empty() => {
                    let outcome = joined.unwrap_or_else(|e| {
                        Err(Error::Status(Status::internal(format!("call handler panicked: {e}"))))
                    });
                    if let Err(e) = outcome {
                        break Some(e);
                    }
                    transition(&mut state, SessionState::Active(calls.len()));
                }
            }
        };

        transition(&mut state, SessionState::Draining);
        let drain = async { while calls.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.drain_timeout, drain).await.is_err() {
            tracing::debug!(open = calls.len(), "drain timeout elapsed, aborting remaining calls");
        }
        mux.close();
        calls.shutdown().await;
        transition(&mut state, SessionState::Closed);

        if let Some(reason) = mux.failure() {
            return Err(reason);
        }
        match failure {
            Some(Error::Cancelled) | None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use edgelink_common::{
        identity::{Identity, IdentityStore, InMemoryIdentityStore},
        testing::TestPki,
    };

    use super::*;

    struct CountingStore {
        inner: InMemoryIdentityStore,
        calls: AtomicUsize,
    }

    impl IdentityStore for CountingStore {
        fn exists(&self, identity: &Identity) -> Result<bool, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.exists(identity)
        }
    }

    #[test]
    fn config_builder_overrides_defaults() {
        let config = ServerConfig::new()
            .with_periodic_interval(Duration::from_millis(250))
            .with_drain_timeout(Duration::from_secs(3));
        assert_eq!(config.periodic_interval, Duration::from_millis(250));
        assert_eq!(config.drain_timeout, Duration::from_secs(3));
        assert_eq!(SessionState::Active(2).to_string(), "active(2)");
    }

    #[tokio::test]
    async fn rejected_connection_consults_store_once() {
        let pki = TestPki::new();
        let store = Arc::new(CountingStore {
            inner: InMemoryIdentityStore::allowing(["edge-01"]),
            calls: AtomicUsize::new(0),
        });
        let server = EdgeServer::new(pki.server_credentials("edgelink-server", Arc::clone(&store)));
        let client = pki.client_credentials("intruder");
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let cancel = CancellationToken::new();
        let (client_side, server_side) = tokio::join!(
            client.client_handshake("localhost", client_io, &cancel),
            server.serve_connection(server_io, None, CancellationToken::new()),
        );

        assert!(matches!(client_side, Err(Error::Unauthenticated { .. })));
        match server_side {
            Err(Error::Unauthenticated { identity }) => assert_eq!(identity.as_str(), "intruder"),
            other => panic!("unexpected server outcome: {other:?}"),
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_token_closes_admitted_connection() {
        let pki = TestPki::new();
        let server = EdgeServer::new(
            pki.server_credentials("edgelink-server", InMemoryIdentityStore::allowing(["edge-01"])),
        );
        let client = pki.client_credentials("edge-01");
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let shutdown = CancellationToken::new();
        let serving = {
            let server = server.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve_connection(server_io, None, shutdown).await })
        };

        let (session, server_identity) = client
            .client_handshake("localhost", client_io, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(server_identity.as_str(), "edgelink-server");
        let mux = MuxConnection::client(session, CancellationToken::new());

        shutdown.cancel();
        serving.await.unwrap().unwrap();
        mux.cancellation().cancelled().await;
        assert!(mux.failure().is_some());
    }
}
