use std::{sync::Arc, time::Duration};

use edgelink_common::{
    config::{ClientCertPath, DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY, TLS_HANDSHAKE_TIMEOUT},
    error::Error,
    tls::ClientCredentials,
};

use crate::{
    backoff::BackoffConfig,
    connection::{ConnectionManager, Queues},
    greeter::GreeterClient,
    streams::{StreamMux, DEFAULT_HEARTBEAT_INTERVAL},
};

/// Configuration for the edge client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address as `host:port`
    pub address:            String,
    /// Name the server certificate must be valid for
    pub server_name:        String,
    /// Path to client certificate files
    pub cert_path:          ClientCertPath,
    /// Prefix of generated heartbeats
    pub name:               String,
    pub heartbeat_interval: Duration,
    /// TCP connect timeout
    pub connect_timeout:    Duration,
    /// Deadline for the TLS handshake and admission verdict
    pub handshake_timeout:  Duration,
    pub backoff:            BackoffConfig,
    /// Sent as `user-agent` metadata with every call
    pub user_agent:         String,
    /// Capacity of each stream queue
    pub queue_capacity:     usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address:            format!("localhost:{DEFAULT_PORT}"),
            server_name:        "localhost".to_string(),
            cert_path:          ClientCertPath::new(),
            name:               "edgelink-client".to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout:    Duration::from_secs(5),
            handshake_timeout:  TLS_HANDSHAKE_TIMEOUT,
            backoff:            BackoffConfig::default(),
            user_agent:         concat!("edgelink-client/", env!("CARGO_PKG_VERSION")).to_string(),
            queue_capacity:     DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address<S: Into<String>>(mut self, address: S) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_server_name<S: Into<String>>(mut self, server_name: S) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the certificate path
    pub fn with_cert_path(mut self, cert_path: ClientCertPath) -> Self {
        self.cert_path = cert_path;
        self
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// # Panics
    ///
    /// Creating a client panics if `capacity` is zero.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// Keeps an edge device connected to the server and its two streams running
#[derive(Clone)]
pub struct EdgeClient {
    manager: Arc<ConnectionManager>,
    streams: StreamMux,
}

impl EdgeClient {
    /// Creates a client, loading its certificates from `config.cert_path`
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let credentials = ClientCredentials::load(&config.cert_path)?;
        Ok(Self::with_credentials(config, credentials))
    }

    /// Creates a client from already loaded credentials
    pub fn with_credentials(config: ClientConfig, credentials: ClientCredentials) -> Self {
        let credentials = credentials.with_handshake_timeout(config.handshake_timeout);
        let streams = StreamMux::new(config.name.clone(), config.heartbeat_interval);
        Self {
            manager: Arc::new(ConnectionManager::new(config, credentials)),
            streams,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        self.manager.config()
    }

    /// Queues shared by every connection this client makes
    pub fn queues(&self) -> &Queues {
        self.manager.queues()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Dials once, with backoff, and returns a greeter for direct calls
    pub async fn connect(&self) -> Result<GreeterClient, Error> {
        self.manager.connect().await.map(GreeterClient::new)
    }

    /// Connects and keeps the streams running, reconnecting after transient
    /// failures.
    ///
    /// Returns `Ok(())` once [`close`](Self::close) is called, or the first
    /// failure reconnecting cannot fix (a rejected identity, bad local
    /// configuration, exhausted attempts).
    pub async fn run(&self) -> Result<(), Error> {
        loop {
            let connection = match self.manager.connect().await {
                Ok(connection) => connection,
                Err(_) if self.manager.is_closed() => return Ok(()),
                Err(e) => return Err(e),
            };

            let outcome = self.streams.run(&connection, self.manager.queues()).await;
            connection.close();
            if self.manager.is_closed() {
                return Ok(());
            }

            match outcome {
                Ok(()) => tracing::info!("streams finished, reconnecting"),
                Err(e) if e.is_transient() => tracing::warn!(error = %e, "connection lost, reconnecting"),
                Err(e) => return Err(e),
            }
        }
    }

    /// Stops the client. Idempotent.
    pub fn close(&self) {
        self.manager.close();
    }

    pub fn is_closed(&self) -> bool {
        self.manager.is_closed()
    }
}
