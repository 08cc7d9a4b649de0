use std::{net::SocketAddr, path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use edgelink_client::{BackoffConfig, ClientCertPath, ClientConfig, EdgeClient, Error, SyslogListener};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit code when the server admitted the TLS session but rejected our identity
const EXIT_REJECTED: u8 = 2;

#[derive(Parser)]
#[command(name = "edgelink-client")]
#[command(about = "edgelink edge client: heartbeats and log forwarding over mutual TLS", version)]
struct Args {
    /// Server address as host:port
    #[arg(long, default_value = "localhost:50051")]
    address: String,

    /// Device name, also selects <certs-dir>/<name>.crt and <name>.key
    #[arg(long, default_value = "edgelink-client")]
    name: String,

    /// Name the server certificate must be valid for
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Directory holding <name>.crt, <name>.key and ca.crt
    #[arg(long, env = "EDGELINK_CLIENT_CERTS_DIR")]
    certs_dir: Option<PathBuf>,

    /// Client certificate (PEM)
    #[arg(long, env = "EDGELINK_CLIENT_CERT")]
    cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, env = "EDGELINK_CLIENT_KEY")]
    key: Option<PathBuf>,

    /// CA bundle used to verify the server (PEM)
    #[arg(long, env = "EDGELINK_CA_CERT")]
    ca: Option<PathBuf>,

    /// Interval between heartbeats, in milliseconds
    #[arg(long, default_value_t = 500)]
    heartbeat_ms: u64,

    /// Receive RFC 5424 syslog datagrams on this address and forward them,
    /// e.g. 0.0.0.0:514
    #[arg(long, value_name = "ADDR")]
    syslog_listen: Option<SocketAddr>,

    /// Give up after this many dial attempts (0 = never)
    #[arg(long, default_value_t = 0)]
    max_attempts: u32,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut cert_path = match &args.certs_dir {
        Some(dir) => ClientCertPath::for_named_client(dir, &args.name),
        None => ClientCertPath::new(),
    };
    if let Some(cert) = args.cert {
        cert_path.cert_path = cert;
    }
    if let Some(key) = args.key {
        cert_path.key_path = key;
    }
    if let Some(ca) = args.ca {
        cert_path.ca_path = ca;
    }

    let config = ClientConfig::new()
        .with_address(&args.address)
        .with_server_name(&args.server_name)
        .with_cert_path(cert_path)
        .with_name(&args.name)
        .with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms))
        .with_backoff(BackoffConfig::default().with_max_attempts(args.max_attempts));
    let client = EdgeClient::new(config).context("Failed to load client credentials")?;

    let stop = CancellationToken::new();

    if let Some(addr) = args.syslog_listen {
        let listener = SyslogListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind syslog listener to {addr}"))?;
        let queue = client.queues().log_out.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.run(queue, stop).await {
                error!(error = %e, "syslog listener failed");
            }
        });
    }

    // Print every heartbeat reply
    {
        let replies = client.queues().heartbeat_in.clone();
        tokio::spawn(async move {
            while let Some(reply) = replies.pop().await {
                println!("client: {}", reply.message);
            }
        });
    }

    {
        let client = client.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal, stopping client...");
                stop.cancel();
                client.close();
            }
        });
    }

    info!(address = %args.address, name = %args.name, "Starting edgelink client...");
    let outcome = client.run().await;
    stop.cancel();
    client.close();

    match outcome {
        Ok(()) => {
            info!("Client stopped");
            Ok(ExitCode::SUCCESS)
        }
        Err(Error::Unauthenticated { identity }) => {
            error!(identity = %identity, "connected, but the server rejected this certificate");
            eprintln!("edgelink-client: server rejected certificate identity {identity}");
            Ok(ExitCode::from(EXIT_REJECTED))
        }
        Err(e) => Err(e).context("Client error"),
    }
}
