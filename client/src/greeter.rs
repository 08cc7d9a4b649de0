use edgelink_common::{
    error::Error,
    message::{Empty, HelloReply, HelloRequest},
    mux::{CallReceiver, CallSender},
    wire::{Metadata, Method},
};

use crate::connection::{CallOptions, Connection};

const USER_AGENT_KEY: &str = "user-agent";

/// Typed calls against the greeter service on one connection
#[derive(Clone)]
pub struct GreeterClient {
    connection: Connection,
}

impl GreeterClient {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Canary call, returns the response headers
    pub async fn empty_call(&self, opts: CallOptions) -> Result<Metadata, Error> {
        let metadata = self.prepare(opts).await?;
        let (headers, _): (Metadata, Empty) = self
            .connection
            .mux()
            .unary(Method::EmptyCall, metadata, &Empty)
            .await?;
        Ok(headers)
    }

    pub async fn say_hello(&self, request: &HelloRequest, opts: CallOptions) -> Result<HelloReply, Error> {
        let metadata = self.prepare(opts).await?;
        let (_, reply) = self
            .connection
            .mux()
            .unary(Method::SayHello, metadata, request)
            .await?;
        Ok(reply)
    }

    /// Canary call issued before the connection is `Active`
    pub(crate) async fn canary(&self) -> Result<Metadata, Error> {
        let metadata = self.with_user_agent(Metadata::new());
        let (headers, _): (Metadata, Empty) = self
            .connection
            .mux()
            .unary(Method::EmptyCall, metadata, &Empty)
            .await?;
        Ok(headers)
    }

    /// Opens the bidirectional heartbeat stream
    pub async fn periodic(&self, opts: CallOptions) -> Result<(CallSender, CallReceiver), Error> {
        let metadata = self.prepare(opts).await?;
        self.connection.mux().open(Method::Periodic, metadata).await
    }

    /// Opens the log forwarding stream
    pub async fn syslog(&self, opts: CallOptions) -> Result<(CallSender, CallReceiver), Error> {
        let metadata = self.prepare(opts).await?;
        self.connection.mux().open(Method::Syslog, metadata).await
    }

    async fn prepare(&self, opts: CallOptions) -> Result<Metadata, Error> {
        self.connection.ready(opts.fail_fast).await?;
        Ok(self.with_user_agent(opts.metadata))
    }

    fn with_user_agent(&self, mut metadata: Metadata) -> Metadata {
        if !metadata.contains_key(USER_AGENT_KEY) {
            metadata.insert(USER_AGENT_KEY, self.connection.user_agent());
        }
        metadata
    }
}
