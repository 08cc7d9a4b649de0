//! Credential layer: mutual TLS with a pinned ALPN protocol, followed by the
//! server's admission verdict.
//!
//! A session is only usable once both sides agree on it. The client verifies
//! the server chain and then waits for [`Frame::Admitted`]; the server
//! verifies the client chain, extracts the certificate common name and asks
//! the [`IdentityStore`] exactly once whether that identity may proceed.

use std::{fs, io::BufReader, path::Path, sync::Arc, time::Duration};

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    server::WebPkiClientVerifier,
    ClientConfig, CommonState, RootCertStore, ServerConfig,
};
use rustls_pemfile::{certs, private_key};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ClientCertPath, ServerCertPath, ALPN_PROTOCOL, TLS_HANDSHAKE_TIMEOUT},
    error::Error,
    identity::{certificate_fingerprint, Identity, IdentityStore},
    wire::{read_frame, write_frame, Frame},
};

fn install_crypto_provider() {
    // Install default crypto provider for rustls if not already installed
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn read_pem(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let chain = certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("failed to parse {what}: {e}")))?;
    if chain.is_empty() {
        return Err(Error::Config(format!("no certificates found in {what}")));
    }
    Ok(chain)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
    private_key(&mut BufReader::new(pem))
        .map_err(|e| Error::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| Error::Config("no private key found".into()))
}

fn parse_roots(ca_pem: &[u8]) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    roots.add_parsable_certificates(parse_certs(ca_pem, "CA bundle")?);
    if roots.is_empty() {
        return Err(Error::Config("no valid CA certificates found".into()));
    }
    Ok(roots)
}

/// Checks the negotiated protocol and returns the peer's leaf certificate
fn negotiated_peer<'a>(
    conn: &'a CommonState,
    peer: &str,
) -> Result<&'a CertificateDer<'static>, Error> {
    if conn.alpn_protocol() != Some(ALPN_PROTOCOL) {
        return Err(Error::Handshake(format!(
            "{peer} did not negotiate {}",
            String::from_utf8_lossy(ALPN_PROTOCOL)
        )));
    }
    conn.peer_certificates()
        .and_then(|chain| chain.first())
        .ok_or_else(|| Error::Handshake(format!("{peer} presented no certificate")))
}

/// Client-side TLS material plus the handshake policy
#[derive(Clone)]
pub struct ClientCredentials {
    config:            Arc<ClientConfig>,
    handshake_timeout: Option<Duration>,
}

impl ClientCredentials {
    /// Loads the client certificate, key and CA bundle from disk
    pub fn load(paths: &ClientCertPath) -> Result<Self, Error> {
        tracing::info!(
            cert = %paths.cert_path.display(),
            key = %paths.key_path.display(),
            ca = %paths.ca_path.display(),
            "loading client credentials"
        );
        Self::from_pem(
            &read_pem(&paths.cert_path)?,
            &read_pem(&paths.key_path)?,
            &read_pem(&paths.ca_path)?,
        )
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8]) -> Result<Self, Error> {
        install_crypto_provider();

        let chain = parse_certs(cert_pem, "client certificate")?;
        let key = parse_private_key(key_pem)?;
        let roots = parse_roots(ca_pem)?;

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)
            .map_err(|e| Error::Config(format!("invalid client certificate: {e}")))?;
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        Ok(Self {
            config:            Arc::new(config),
            handshake_timeout: None,
        })
    }

    /// Bounds the whole handshake, verdict included
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Runs the TLS handshake over `raw` and waits for the admission verdict.
    ///
    /// Returns the session and the server's certificate identity. Firing
    /// `cancel` drops the in-flight handshake together with the transport.
    pub async fn client_handshake<IO>(
        &self,
        server_name: &str,
        raw: IO,
        cancel: &CancellationToken,
    ) -> Result<(client::TlsStream<IO>, Identity), Error>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| Error::Config(format!("invalid server name {server_name:?}: {e}")))?;
        let connector = TlsConnector::from(Arc::clone(&self.config));

        let handshake = Self::connect_and_await_verdict(connector, name, raw);
        let bounded = async {
            match self.handshake_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, handshake).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Handshake("deadline exceeded".into())),
                    }
                }
                None => handshake.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = bounded => result,
        }
    }

    async fn connect_and_await_verdict<IO>(
        connector: TlsConnector,
        name: ServerName<'static>,
        raw: IO,
    ) -> Result<(client::TlsStream<IO>, Identity), Error>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = connector
            .connect(name, raw)
            .await
            .map_err(|e| Error::Handshake(e.to_string()))?;

        let leaf = negotiated_peer(stream.get_ref().1, "server")?;
        let server_identity = Identity::from_certificate(leaf)?;

        match read_frame(&mut stream).await {
            Ok(Frame::Admitted) => Ok((stream, server_identity)),
            Ok(Frame::Rejected { identity }) => {
                Err(Error::Unauthenticated {
                    identity: Identity::new(identity),
                })
            }
            Ok(other) => {
                Err(Error::Handshake(format!(
                    "expected admission verdict, got {other:?}"
                )))
            }
            Err(e) => Err(Error::Handshake(format!("no admission verdict: {e}"))),
        }
    }
}

/// Server-side TLS material and the allowlist it enforces
#[derive(Clone)]
pub struct ServerCredentials {
    config:            Arc<ServerConfig>,
    store:             Arc<dyn IdentityStore>,
    handshake_timeout: Duration,
}

impl ServerCredentials {
    /// Loads the server certificate, key and client CA bundle from disk
    pub fn load(paths: &ServerCertPath, store: impl IdentityStore + 'static) -> Result<Self, Error> {
        tracing::info!(
            cert = %paths.cert_path.display(),
            key = %paths.key_path.display(),
            ca = %paths.ca_path.display(),
            "loading server credentials"
        );
        Self::from_pem(
            &read_pem(&paths.cert_path)?,
            &read_pem(&paths.key_path)?,
            &read_pem(&paths.ca_path)?,
            store,
        )
    }

    pub fn from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        ca_pem: &[u8],
        store: impl IdentityStore + 'static,
    ) -> Result<Self, Error> {
        install_crypto_provider();

        let chain = parse_certs(cert_pem, "server certificate")?;
        let key = parse_private_key(key_pem)?;
        let roots = parse_roots(ca_pem)?;

        let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::Config(format!("invalid client verifier: {e}")))?;

        let mut config = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(chain, key)
            .map_err(|e| Error::Config(format!("invalid server certificate: {e}")))?;
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        Ok(Self {
            config:            Arc::new(config),
            store:             Arc::new(store),
            handshake_timeout: TLS_HANDSHAKE_TIMEOUT,
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// TLS handshake requiring a verified client certificate
    pub async fn server_handshake<IO>(
        &self,
        raw: IO,
    ) -> Result<(server::TlsStream<IO>, Identity), Error>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = TlsAcceptor::from(Arc::clone(&self.config));
        let stream = tokio::time::timeout(self.handshake_timeout, acceptor.accept(raw))
            .await
            .map_err(|_| Error::Handshake("deadline exceeded".into()))?
            .map_err(|e| Error::Handshake(e.to_string()))?;

        let leaf = negotiated_peer(stream.get_ref().1, "client")?;
        let identity = Identity::from_certificate(leaf)?;
        Ok((stream, identity))
    }

    /// Whether `identity` is on the allowlist
    pub fn authorize(&self, identity: &Identity) -> Result<bool, Error> {
        self.store.exists(identity)
    }

    /// Sends the admission verdict for `identity`.
    ///
    /// A rejected session is shut down before this returns.
    pub async fn admit<IO>(
        &self,
        mut stream: server::TlsStream<IO>,
        identity: &Identity,
    ) -> Result<server::TlsStream<IO>, Error>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let fingerprint = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(certificate_fingerprint)
            .unwrap_or_default();

        let authorized = match self.authorize(identity) {
            Ok(authorized) => authorized,
            Err(e) => {
                tracing::error!(identity = %identity, error = %e, "identity store lookup failed");
                false
            }
        };

        if authorized {
            tracing::info!(identity = %identity, fingerprint = %fingerprint, "client admitted");
            write_frame(&mut stream, &Frame::Admitted).await?;
            return Ok(stream);
        }

        tracing::warn!(identity = %identity, fingerprint = %fingerprint, "cert not found, rejecting client");
        let verdict = Frame::Rejected {
            identity: identity.to_string(),
        };
        if let Err(e) = write_frame(&mut stream, &verdict).await {
            tracing::debug!(error = %e, "failed to deliver rejection verdict");
        }
        if let Err(e) = stream.shutdown().await {
            tracing::debug!(error = %e, "failed to shut down rejected session");
        }

        Err(Error::Unauthenticated {
            identity: identity.clone(),
        })
    }

    /// Handshake followed by admission
    pub async fn accept<IO>(&self, raw: IO) -> Result<(server::TlsStream<IO>, Identity), Error>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let (stream, identity) = self.server_handshake(raw).await?;
        let stream = self.admit(stream, &identity).await?;
        Ok((stream, identity))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::{identity::InMemoryIdentityStore, testing::TestPki};

    const SERVER_CN: &str = "edgelink-server";

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

    #[tokio::test]
    async fn authorized_client_is_admitted() {
        let pki = TestPki::new();
        let store = Arc::new(CountingStore {
            inner: InMemoryIdentityStore::allowing(["edge-01"]),
            calls: AtomicUsize::new(0),
        });
        let server = pki.server_credentials(SERVER_CN, Arc::clone(&store));
        let client = pki.client_credentials("edge-01");
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let cancel = CancellationToken::new();
        let (client_side, server_side) = tokio::join!(
            client.client_handshake("localhost", client_io, &cancel),
            server.accept(server_io),
        );

        let (_, server_identity) = client_side.unwrap();
        let (_, client_identity) = server_side.unwrap();
        assert_eq!(server_identity.as_str(), SERVER_CN);
        assert_eq!(client_identity.as_str(), "edge-01");
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_client_gets_rejected_and_disconnected() {
        let pki = TestPki::new();
        let server =
            pki.server_credentials(SERVER_CN, InMemoryIdentityStore::allowing(["edge-01"]));
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        // Handshake by hand so the client keeps the session after the verdict
        let connector = TlsConnector::from(Arc::clone(&pki.client_credentials("stranger").config));
        let name = ServerName::try_from("localhost").unwrap();
        let (client_side, server_side) =
            tokio::join!(connector.connect(name, client_io), server.accept(server_io));

        match server_side {
            Err(Error::Unauthenticated { identity }) => assert_eq!(identity.as_str(), "stranger"),
            other => panic!("expected rejection, got {:?}", other.map(|(_, id)| id)),
        }

        let mut session = client_side.unwrap();
        assert_eq!(read_frame(&mut session).await.unwrap(), Frame::Rejected {
            identity: "stranger".into()
        });
        let mut rest = Vec::new();
        assert_eq!(session.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn client_sees_rejection_as_unauthenticated() {
        let pki = TestPki::new();
        let server = pki.server_credentials(SERVER_CN, InMemoryIdentityStore::new());
        let client = pki.client_credentials("edge-02");
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let cancel = CancellationToken::new();
        let (client_side, _) = tokio::join!(
            client.client_handshake("localhost", client_io, &cancel),
            server.accept(server_io),
        );

        match client_side {
            Err(err @ Error::Unauthenticated { .. }) => assert!(!err.is_transient()),
            other => panic!("expected Unauthenticated, got {:?}", other.map(|(_, id)| id)),
        }
    }

    #[tokio::test]
    async fn missing_alpn_fails_the_handshake() {
        let pki = TestPki::new();
        let server =
            pki.server_credentials(SERVER_CN, InMemoryIdentityStore::allowing(["edge-01"]));
        let mut client = pki.client_credentials("edge-01");
        let mut config = (*client.config).clone();
        config.alpn_protocols.clear();
        client.config = Arc::new(config);

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let (client_side, server_side) = tokio::join!(
            client.client_handshake("localhost", client_io, &cancel),
            server.server_handshake(server_io),
        );

        assert!(matches!(client_side, Err(Error::Handshake(_))));
        assert!(matches!(server_side, Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn foreign_alpn_fails_the_handshake() {
        let pki = TestPki::new();
        let server =
            pki.server_credentials(SERVER_CN, InMemoryIdentityStore::allowing(["edge-01"]));
        let mut client = pki.client_credentials("edge-01");
        let mut config = (*client.config).clone();
        config.alpn_protocols = vec![b"h2".to_vec()];
        client.config = Arc::new(config);

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let (client_side, server_side) = tokio::join!(
            client.client_handshake("localhost", client_io, &cancel),
            server.server_handshake(server_io),
        );

        assert!(matches!(client_side, Err(Error::Handshake(_))));
        assert!(matches!(server_side, Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn cancelled_handshake_reports_cancelled() {
        let pki = TestPki::new();
        let client = pki.client_credentials("edge-01");
        let (client_io, _silent_peer) = tokio::io::duplex(1024);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client.client_handshake("localhost", client_io, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn cancelling_mid_handshake_drops_the_transport() {
        let pki = TestPki::new();
        let client = pki.client_credentials("edge-01");
        let (client_io, mut peer) = tokio::io::duplex(64 * 1024);

        let cancel = CancellationToken::new();
        let handshake = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .client_handshake("localhost", client_io, &cancel)
                    .await
                    .map(|(_, identity)| identity)
            })
        };

        // A handshake record header means the ClientHello is on the wire
        let mut header = [0u8; 5];
        peer.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x16);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handshake)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_hits_handshake_deadline() {
        let pki = TestPki::new();
        let client = pki
            .client_credentials("edge-01")
            .with_handshake_timeout(Duration::from_secs(5));
        let (client_io, _silent_peer) = tokio::io::duplex(64 * 1024);

        let result = client
            .client_handshake("localhost", client_io, &CancellationToken::new())
            .await;
        match result {
            Err(err @ Error::Handshake(_)) => assert!(err.is_transient()),
            other => panic!("expected deadline error, got {:?}", other.map(|(_, id)| id)),
        }
    }

    #[test]
    fn loads_credentials_from_disk() {
        let pki = TestPki::new();
        let issued = pki.issue("edge-03");
        let dir = std::env::temp_dir().join(format!("edgelink-certs-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("edge-03.crt"), &issued.cert_pem).unwrap();
        fs::write(dir.join("edge-03.key"), &issued.key_pem).unwrap();
        fs::write(dir.join("ca.crt"), pki.ca_pem()).unwrap();

        let loaded = ClientCredentials::load(&ClientCertPath::for_named_client(&dir, "edge-03"));
        let missing = ClientCredentials::load(&ClientCertPath::for_named_client(&dir, "edge-04"));
        fs::remove_dir_all(&dir).ok();

        assert!(loaded.is_ok());
        assert!(matches!(missing, Err(Error::Config(_))));
    }
}
