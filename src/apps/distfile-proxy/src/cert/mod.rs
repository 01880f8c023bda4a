pub mod ca;

pub use ca::CertificateAuthority;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("SNI is required for this service")]
    MissingSni,

    #[error("Certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    #[error("Failed to parse certificate: {0}")]
    InvalidCertificate(String),

    #[error("Failed to parse private key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rcgen::Error> for CertError {
    fn from(err: rcgen::Error) -> Self {
        CertError::CertificateGenerationFailed(err.to_string())
    }
}

pub type CertResult<T> = Result<T, CertError>;

/// Mints a certificate for the server name a client announced during the
/// TLS handshake. Called once per handshake; implementations must not block
/// on I/O.
pub trait CertificateIssuer: Send + Sync {
    fn issue(&self, server_name: &str) -> CertResult<Arc<CertifiedKey>>;
}

/// rustls certificate hook that asks a [`CertificateIssuer`] for a fresh
/// certificate on every handshake. Returning `None` aborts the handshake.
pub struct IssuingCertResolver {
    issuer: Arc<dyn CertificateIssuer>,
}

impl IssuingCertResolver {
    pub fn new(issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self { issuer }
    }
}

impl std::fmt::Debug for IssuingCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuingCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for IssuingCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name().unwrap_or_default();
        match self.issuer.issue(server_name) {
            Ok(key) => {
                debug!("Issued certificate for {}", server_name);
                Some(key)
            }
            Err(e) => {
                warn!("Refusing TLS handshake for '{}': {}", server_name, e);
                None
            }
        }
    }
}
