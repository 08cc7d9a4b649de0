//! Throwaway PKI for tests: one CA issuing server and client certificates.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;

use crate::tls::{ClientCredentials, ServerCredentials};
use crate::identity::IdentityStore;

/// Host name placed in every issued certificate's SAN list
pub const TEST_SERVER_NAME: &str = "localhost";

/// A certificate and private key issued by [`TestPki`]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem:  String,
    pub cert_der: CertificateDer<'static>,
}

/// A self-signed CA able to issue leaf certificates
pub struct TestPki {
    ca_cert: Certificate,
    ca_key:  KeyPair,
}

impl TestPki {
    /// # Panics
    ///
    /// Panics if certificate generation fails (test-only).
    pub fn new() -> Self {
        Self::with_ca_name("edgelink test CA")
    }

    pub fn with_ca_name(name: &str) -> Self {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_key = KeyPair::generate().expect("CA key generation should succeed");
        let ca_cert = params
            .self_signed(&ca_key)
            .expect("CA self-signing should succeed");

        Self { ca_cert, ca_key }
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// Issues a leaf usable for both server and client authentication
    pub fn issue(&self, common_name: &str) -> IssuedCert {
        let mut params = CertificateParams::new(vec![TEST_SERVER_NAME.to_string()])
            .expect("valid subject alt names");
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let key = KeyPair::generate().expect("leaf key generation should succeed");
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .expect("leaf signing should succeed");

        IssuedCert {
            cert_pem: cert.pem(),
            key_pem:  key.serialize_pem(),
            cert_der: cert.der().clone(),
        }
    }

    /// Server credentials for `common_name`, checking clients against `store`
    pub fn server_credentials(
        &self,
        common_name: &str,
        store: impl IdentityStore + 'static,
    ) -> ServerCredentials {
        let issued = self.issue(common_name);
        ServerCredentials::from_pem(
            issued.cert_pem.as_bytes(),
            issued.key_pem.as_bytes(),
            self.ca_pem().as_bytes(),
            store,
        )
        .expect("server credentials should build")
    }

    /// Client credentials presenting a certificate for `common_name`
    pub fn client_credentials(&self, common_name: &str) -> ClientCredentials {
        let issued = self.issue(common_name);
        ClientCredentials::from_pem(
            issued.cert_pem.as_bytes(),
            issued.key_pem.as_bytes(),
            self.ca_pem().as_bytes(),
        )
        .expect("client credentials should build")
    }
}

impl Default for TestPki {
    fn default() -> Self {
        Self::new()
    }
}
