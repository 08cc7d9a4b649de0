//! Client and server over real TCP with a generated PKI.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{TimeZone, Utc};
use edgelink_client::{CallOptions, ClientConfig, ConnectionState, EdgeClient};
use edgelink_common::{
    testing::TestPki, Error, HelloReply, HelloRequest, Identity, IdentityStore, InMemoryIdentityStore,
    LogEntry,
};
use edgelink_server::{EdgeServer, ForwardedLog};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

struct CountingStore {
    inner: InMemoryIdentityStore,
    calls: AtomicUsize,
}

impl CountingStore {
    fn allowing(identity: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryIdentityStore::allowing([identity]),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IdentityStore for CountingStore {
    fn exists(&self, identity: &Identity) -> Result<bool, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.exists(identity)
    }
}

struct TestServer {
    addr:     SocketAddr,
    logs:     mpsc::Receiver<ForwardedLog>,
    shutdown: CancellationToken,
    task:     JoinHandle<Result<(), Error>>,
}

impl TestServer {
    async fn start(pki: &TestPki, store: impl IdentityStore + 'static) -> Self {
        let (log_tx, logs) = mpsc::channel(16);
        let server =
            EdgeServer::new(pki.server_credentials("edgelink-server", store)).with_log_sink(log_tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.run_with_shutdown(listener, shutdown).await })
        };
        Self {
            addr,
            logs,
            shutdown,
            task,
        }
    }

    fn client(&self, pki: &TestPki, name: &str) -> EdgeClient {
        let config = ClientConfig::new()
            .with_address(self.addr.to_string())
            .with_name(name)
            .with_heartbeat_interval(Duration::from_millis(50));
        EdgeClient::with_credentials(config, pki.client_credentials(name))
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(TIMEOUT, self.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn authorized_client_gets_heartbeat_reply_naming_it() {
    let pki = TestPki::new();
    let server = TestServer::start(&pki, InMemoryIdentityStore::allowing(["edge-01"])).await;
    let client = server.client(&pki, "edge-01");

    let greeter = tokio::time::timeout(TIMEOUT, client.connect()).await.unwrap().unwrap();
    assert_eq!(greeter.connection().state(), ConnectionState::Active);
    assert_eq!(greeter.connection().server_identity().as_str(), "edgelink-server");

    let (sender, mut receiver) = greeter.periodic(CallOptions::new()).await.unwrap();
    sender.send(&HelloRequest::new("probe-1")).await.unwrap();
    let reply: HelloReply = tokio::time::timeout(TIMEOUT, receiver.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(reply.message.contains("edge-01"), "unexpected reply {:?}", reply.message);

    client.close();
    server.stop().await;
}

#[tokio::test]
async fn running_client_delivers_queued_heartbeat_replies() {
    let pki = TestPki::new();
    let server = TestServer::start(&pki, InMemoryIdentityStore::allowing(["edge-01"])).await;
    let client = server.client(&pki, "edge-01");

    client
        .queues()
        .heartbeat_out
        .push(HelloRequest::new("ping-1"))
        .await
        .unwrap();
    let running = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    let reply = tokio::time::timeout(TIMEOUT, client.queues().heartbeat_in.pop())
        .await
        .unwrap()
        .unwrap();
    assert!(reply.message.starts_with("edge-01: "));

    client.close();
    tokio::time::timeout(TIMEOUT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    server.stop().await;
}

#[tokio::test]
async fn unauthorized_client_is_rejected_without_retry() {
    let pki = TestPki::new();
    let store = CountingStore::allowing("edge-01");
    let server = TestServer::start(&pki, Arc::clone(&store)).await;
    // Default backoff never gives up on transient failures
    let client = server.client(&pki, "intruder");

    let outcome = tokio::time::timeout(TIMEOUT, client.run()).await.unwrap();
    match outcome {
        Err(Error::Unauthenticated { identity }) => assert_eq!(identity.as_str(), "intruder"),
        other => panic!("expected a rejection, got {other:?}"),
    }
    assert_eq!(store.calls(), 1);
    assert!(client.manager().current().is_none());

    server.stop().await;
}

#[tokio::test]
async fn forwarded_log_entry_arrives_unchanged() {
    let pki = TestPki::new();
    let mut server = TestServer::start(&pki, InMemoryIdentityStore::allowing(["edge-01"])).await;
    let client = server.client(&pki, "edge-01");

    let t0 = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();
    let entry = LogEntry::new(3, "auth", "login failed").with_timestamp(t0);
    client.queues().log_out.push(entry.clone()).await.unwrap();

    let running = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    let forwarded = tokio::time::timeout(TIMEOUT, server.logs.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded.identity.as_str(), "edge-01");
    assert_eq!(forwarded.entry, entry);
    assert_eq!(forwarded.entry.severity, 3);
    assert_eq!(forwarded.entry.app_name, "auth");
    assert_eq!(forwarded.entry.text, "login failed");
    assert_eq!(forwarded.entry.timestamp, Some(t0));

    client.close();
    tokio::time::timeout(TIMEOUT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    server.stop().await;
}

#[tokio::test]
async fn one_authorization_per_connection() {
    let pki = TestPki::new();
    let store = CountingStore::allowing("edge-01");
    let server = TestServer::start(&pki, Arc::clone(&store)).await;
    let client = server.client(&pki, "edge-01");

    let greeter = tokio::time::timeout(TIMEOUT, client.connect()).await.unwrap().unwrap();
    for i in 0..5 {
        let reply = greeter
            .say_hello(&HelloRequest::new(format!("hello {i}")), CallOptions::new())
            .await
            .unwrap();
        assert_eq!(reply.message, "Hello edge-01");
    }
    assert_eq!(store.calls(), 1);

    client.close();
    server.stop().await;
}

#[tokio::test]
async fn canary_echoes_user_agent() {
    let pki = TestPki::new();
    let server = TestServer::start(&pki, InMemoryIdentityStore::allowing(["edge-01"])).await;
    let client = server.client(&pki, "edge-01");

    let greeter = tokio::time::timeout(TIMEOUT, client.connect()).await.unwrap().unwrap();
    let headers = greeter
        .empty_call(CallOptions::new().fail_fast(true).with_metadata("user-agent", "edge-agent/2.0"))
        .await
        .unwrap();
    assert_eq!(headers.get_all("ua").collect::<Vec<_>>(), vec!["edge-agent/2.0"]);

    let headers = greeter.empty_call(CallOptions::new()).await.unwrap();
    assert_eq!(headers.get("ua"), Some(client.config().user_agent.as_str()));

    client.close();
    server.stop().await;
}
