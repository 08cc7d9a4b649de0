use std::{env, path::PathBuf, time::Duration};

/// Default TCP port the server listens on
pub const DEFAULT_PORT: u16 = 50051;

/// The only application protocol either side will negotiate
pub const ALPN_PROTOCOL: &[u8] = b"edgelink/1";

/// Default capacity of every inbound and outbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Largest frame accepted on the wire (1MB)
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Upper bound for the server side of the TLS handshake
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const CERTS_DIR_ENV: &str = "EDGELINK_CERTS_DIR";
const DEFAULT_CERTS_DIR: &str = "certs";

const SERVER_CERTS_SUBDIR: &str = "server";
const CLIENT_CERTS_SUBDIR: &str = "client";

fn get_certs_dir() -> PathBuf {
    let dir = env::var(CERTS_DIR_ENV).unwrap_or(DEFAULT_CERTS_DIR.to_string());
    PathBuf::from(dir)
}

/// Server certificate paths for TLS authentication
#[derive(Debug, Clone)]
pub struct ServerCertPath {
    /// Path to the server certificate file
    pub cert_path: PathBuf,
    /// Path to the server private key file
    pub key_path:  PathBuf,
    /// Path to the certificate authority used to verify clients
    pub ca_path:   PathBuf,
}

impl ServerCertPath {
    /// Creates ServerCertPath with default certificate locations.
    /// Certificates are expected in a 'server' subdirectory within the base
    /// certs directory.
    pub fn new() -> Self {
        let base = get_certs_dir().join(SERVER_CERTS_SUBDIR);
        Self {
            cert_path: base.join("server.pem"),
            key_path:  base.join("server.key.pem"),
            ca_path:   get_certs_dir().join("root-ca.pem"),
        }
    }
}

impl Default for ServerCertPath {
    fn default() -> Self {
        Self::new()
    }
}

/// Certificate paths for client authentication
#[derive(Debug, Clone)]
pub struct ClientCertPath {
    /// Path to the client certificate file
    pub cert_path: PathBuf,
    /// Path to the client private key file
    pub key_path:  PathBuf,
    /// Path to the certificate authority used to verify the server
    pub ca_path:   PathBuf,
}

impl ClientCertPath {
    /// Creates ClientCertPath with default certificate locations.
    /// Certificates are expected in a 'client' subdirectory within the base
    /// certs directory.
    pub fn new() -> Self {
        let base = get_certs_dir().join(CLIENT_CERTS_SUBDIR);
        Self {
            cert_path: base.join("client.pem"),
            key_path:  base.join("client.key.pem"),
            ca_path:   get_certs_dir().join("root-ca.pem"),
        }
    }

    /// Points every path at `<dir>/<name>.crt`, `<dir>/<name>.key` and
    /// `<dir>/ca.crt`
    pub fn for_named_client(dir: impl Into<PathBuf>, name: &str) -> Self {
        let dir = dir.into();
        Self {
            cert_path: dir.join(format!("{name}.crt")),
            key_path:  dir.join(format!("{name}.key")),
            ca_path:   dir.join("ca.crt"),
        }
    }
}

impl Default for ClientCertPath {
    fn default() -> Self {
        Self::new()
    }
}
