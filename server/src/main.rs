use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use edgelink_common::{
    config::{ServerCertPath, DEFAULT_PORT},
    InMemoryIdentityStore, ServerCredentials,
};
use edgelink_server::{EdgeServer, ServerConfig};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "edgelink-server")]
#[command(about = "edgelink server with mutual TLS and a certificate allowlist", version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    listen: SocketAddr,

    /// Server certificate (PEM), defaults to $EDGELINK_CERTS_DIR/server/server.pem
    #[arg(long, env = "EDGELINK_SERVER_CERT")]
    cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long, env = "EDGELINK_SERVER_KEY")]
    key: Option<PathBuf>,

    /// CA bundle used to verify client certificates (PEM)
    #[arg(long, env = "EDGELINK_CA_CERT")]
    ca: Option<PathBuf>,

    /// Certificate common name to admit, may be repeated
    #[arg(long = "allow", value_name = "CN")]
    allow: Vec<String>,

    /// JSON object mapping common names to true/false
    #[arg(long, value_name = "FILE")]
    allowlist: Option<PathBuf>,

    /// Interval between Periodic replies, in milliseconds
    #[arg(long, default_value_t = 100)]
    periodic_ms: u64,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    info!("Starting edgelink server...");

    let mut cert_path = ServerCertPath::new();
    if let Some(cert) = args.cert {
        cert_path.cert_path = cert;
    }
    if let Some(key) = args.key {
        cert_path.key_path = key;
    }
    if let Some(ca) = args.ca {
        cert_path.ca_path = ca;
    }

    let mut store = match &args.allowlist {
        Some(path) => {
            InMemoryIdentityStore::from_json_file(path)
                .with_context(|| format!("Failed to load allowlist {}", path.display()))?
        }
        None => InMemoryIdentityStore::new(),
    };
    for identity in args.allow {
        store = store.with_entry(identity, true);
    }
    if store.is_empty() {
        warn!("Allowlist is empty, every client will be rejected");
    } else {
        info!(entries = store.len(), "Allowlist loaded");
    }

    let credentials =
        ServerCredentials::load(&cert_path, store).context("Failed to load server credentials")?;
    let config =
        ServerConfig::new().with_periodic_interval(Duration::from_millis(args.periodic_ms));
    let server = EdgeServer::new(credentials).with_config(config);

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", args.listen))?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal, stopping server...");
                shutdown.cancel();
            }
        });
    }

    server
        .run_with_shutdown(listener, shutdown)
        .await
        .context("Server error")?;

    info!("Server shutdown completed");
    Ok(())
}
