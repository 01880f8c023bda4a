use crate::cert::{CertificateIssuer, IssuingCertResolver};

use hyper::StatusCode;
use std::sync::Arc;
use tokio_rustls::rustls;

/// Custom error type for proxy operations
#[derive(Debug)]
pub enum ProxyError {
    /// IO-related errors
    Io(std::io::Error),
    /// TLS/rustls-related errors
    Tls(rustls::Error),
    /// The connection serving a CONNECT request cannot be taken over
    HijackUnsupported,
    /// Taking over the connection of a CONNECT request failed
    HijackIo(hyper::Error),
    /// Generic errors with a message
    Generic(String),
}

impl ProxyError {
    /// Status to answer with when the error ends a request.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::HijackIo(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Io(e) => write!(f, "IO error: {}", e),
            ProxyError::Tls(e) => write!(f, "TLS error: {}", e),
            ProxyError::HijackUnsupported => {
                write!(f, "Connection hijacking is not supported by this server")
            }
            ProxyError::HijackIo(e) => write!(f, "Failed to hijack connection: {}", e),
            ProxyError::Generic(msg) => write!(f, "Proxy error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Io(e) => Some(e),
            ProxyError::Tls(e) => Some(e),
            ProxyError::HijackIo(e) => Some(e),
            ProxyError::HijackUnsupported | ProxyError::Generic(_) => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(err)
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err)
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Build the TLS server configuration for bridged connections. Every
/// handshake asks `issuer` for a certificate matching the client's SNI.
pub fn build_server_tls(issuer: Arc<dyn CertificateIssuer>) -> ProxyResult<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut cfg = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(IssuingCertResolver::new(issuer)));
    cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(cfg)
}

/// Check if an error indicates a closed connection
pub fn is_closed<E: std::fmt::Display>(e: &E) -> bool {
    let s = e.to_string().to_lowercase();
    s.contains("broken pipe")
        || s.contains("connection reset")
        || s.contains("connection aborted")
        || s.contains("unexpected eof")
        || s.contains("close_notify")
}
