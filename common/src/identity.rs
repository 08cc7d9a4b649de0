//! Certificate-derived peer identities and the allowlist consulted at
//! handshake time.

use std::{collections::HashMap, fmt, fs, path::Path, sync::Arc};

use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Common name of a verified leaf certificate
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self(common_name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extracts the subject common name of a DER certificate
    pub fn from_certificate(cert: &CertificateDer<'_>) -> Result<Self, Error> {
        let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
            .map_err(|e| Error::Handshake(format!("failed to parse peer certificate: {e}")))?;

        let cn = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or_else(|| Error::Handshake("peer certificate has no common name".into()))?;

        Ok(Self::new(cn))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lowercase hex SHA-256 of a DER certificate, used in audit logs
pub fn certificate_fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

/// Allowlist lookup used by the server credential layer.
///
/// Implementations must tolerate concurrent calls from many handshakes.
pub trait IdentityStore: Send + Sync {
    fn exists(&self, identity: &Identity) -> Result<bool, Error>;
}

impl<S: IdentityStore + ?Sized> IdentityStore for Arc<S> {
    fn exists(&self, identity: &Identity) -> Result<bool, Error> {
        (**self).exists(identity)
    }
}

/// Allowlist fixed at construction time. Lookups take no lock.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdentityStore {
    entries: HashMap<Identity, bool>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store authorizing every given identity
    pub fn allowing<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: identities
                .into_iter()
                .map(|id| (Identity::new(id), true))
                .collect(),
        }
    }

    /// Loads a JSON object mapping common names to booleans, for example
    /// `{"edge-01": true, "edge-02": false}`
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = fs::read(path)
            .map_err(|e| Error::Store(format!("failed to read {}: {e}", path.display())))?;
        let entries: HashMap<Identity, bool> = serde_json::from_slice(&raw)
            .map_err(|e| Error::Store(format!("failed to parse {}: {e}", path.display())))?;
        Ok(Self { entries })
    }

    pub fn with_entry(mut self, identity: impl Into<String>, authorized: bool) -> Self {
        self.entries.insert(Identity::new(identity), authorized);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn exists(&self, identity: &Identity) -> Result<bool, Error> {
        Ok(self.entries.get(identity).copied().unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::testing::TestPki;

    #[test]
    fn absent_or_disabled_identities_are_unauthorized() {
        let store = InMemoryIdentityStore::allowing(["sati-pii"]).with_entry("retired", false);

        assert!(store.exists(&Identity::new("sati-pii")).unwrap());
        assert!(!store.exists(&Identity::new("retired")).unwrap());
        assert!(!store.exists(&Identity::new("stranger")).unwrap());
    }

    #[test]
    fn loads_allowlist_from_json() {
        let path = std::env::temp_dir().join(format!("edgelink-allow-{}.json", std::process::id()));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(br#"{"edge-01": true, "edge-02": false}"#)
            .unwrap();

        let store = InMemoryIdentityStore::from_json_file(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(store.len(), 2);
        assert!(store.exists(&Identity::new("edge-01")).unwrap());
        assert!(!store.exists(&Identity::new("edge-02")).unwrap());
    }

    #[test]
    fn malformed_allowlist_is_a_store_error() {
        let path = std::env::temp_dir().join(format!("edgelink-bad-{}.json", std::process::id()));
        fs::write(&path, b"[not, json").unwrap();

        let result = InMemoryIdentityStore::from_json_file(&path);
        fs::remove_file(&path).ok();

        assert!(matches!(result, Err(Error::Store(_))));
    }

    #[test]
    fn extracts_common_name_from_certificate() {
        let pki = TestPki::new();
        let issued = pki.issue("edge-42");

        let identity = Identity::from_certificate(&issued.cert_der).unwrap();
        assert_eq!(identity.as_str(), "edge-42");
        assert_eq!(certificate_fingerprint(&issued.cert_der).len(), 64);
    }
}
