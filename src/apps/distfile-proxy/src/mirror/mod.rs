//! Chain of protocol-aware handlers answering requests from the mirror.
//!
//! Each [`MirrorLink`] either answers a request from the cache, defers it to
//! the next link, or fails it. A chain that runs out of links refuses the
//! request with 404: nothing is ever fetched from the origin.

pub mod body;
pub mod container;
pub mod file;
pub mod patterns;

pub use body::MirrorBody;
pub use container::ContainerMirror;
pub use file::FileMirror;
pub use patterns::{RegistryPatterns, RegistryRoute};

use crate::blob::{BlobError, BlobStore};
use crate::db::{MetadataStore, StoreError};
use crate::proxy::RequestHandler;

use async_trait::async_trait;
use hyper::{Method, Request, Response, StatusCode, header};
use std::sync::Arc;
use tracing::{debug, error};

/// The parts of a request the links look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRequest {
    pub method: Method,
    /// Host as the client addressed it, including any explicit port.
    pub host: String,
    /// Path exactly as received, still percent-encoded.
    pub path: String,
    pub query: Option<String>,
}

impl MirrorRequest {
    /// Absolute-form and HTTP/2 requests carry the host in the URI; origin-form
    /// requests fall back to the `Host` header.
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let host = match req.uri().authority() {
            Some(authority) => match authority.port_u16() {
                Some(port) => format!("{}:{}", authority.host(), port),
                None => authority.host().to_string(),
            },
            None => req
                .headers()
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        };

        Self {
            method: req.method().clone(),
            host,
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
        }
    }

    /// The URI the client asked for, as stored by the ingestion jobs.
    pub fn source_uri(&self, scheme: &str) -> String {
        match &self.query {
            Some(query) => format!("{}://{}{}?{}", scheme, self.host, self.path, query),
            None => format!("{}://{}{}", scheme, self.host, self.path),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("object {key} not found in bucket {bucket}")]
    BlobNotFound { bucket: &'static str, key: String },

    #[error("Files may only be downloaded using HTTP GET requests")]
    MethodNotAllowed,

    #[error("{uri}: expected {expected} bytes, blob storage returned {actual}")]
    SizeMismatch {
        uri: String,
        expected: u64,
        actual: u64,
    },

    #[error("{uri}: expected SHA-256 {expected}, blob storage returned {actual}")]
    ChecksumMismatch {
        uri: String,
        expected: String,
        actual: String,
    },

    #[error("failed to build response: {0}")]
    Http(#[from] hyper::http::Error),
}

impl MirrorError {
    pub fn status(&self) -> StatusCode {
        match self {
            MirrorError::BlobNotFound { .. } => StatusCode::NOT_FOUND,
            MirrorError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            MirrorError::Store(_)
            | MirrorError::Blob(_)
            | MirrorError::SizeMismatch { .. }
            | MirrorError::ChecksumMismatch { .. }
            | MirrorError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> Response<MirrorBody> {
        body::text_response(self.status(), &self.to_string())
    }
}

/// Result of offering a request to one link.
#[derive(Debug)]
pub enum LinkOutcome {
    Handled(Response<MirrorBody>),
    Deferred,
    Failed(MirrorError),
}

impl From<Result<Option<Response<MirrorBody>>, MirrorError>> for LinkOutcome {
    fn from(result: Result<Option<Response<MirrorBody>>, MirrorError>) -> Self {
        match result {
            Ok(Some(response)) => LinkOutcome::Handled(response),
            Ok(None) => LinkOutcome::Deferred,
            Err(e) => LinkOutcome::Failed(e),
        }
    }
}

#[async_trait]
pub trait MirrorLink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn serve(&self, req: &MirrorRequest) -> LinkOutcome;
}

pub struct MirrorChain {
    links: Vec<Arc<dyn MirrorLink>>,
}

impl MirrorChain {
    pub fn new(links: Vec<Arc<dyn MirrorLink>>) -> Self {
        Self { links }
    }

    /// File link, then container link, for requests that arrived over
    /// `scheme`.
    pub fn mirrors(
        scheme: &str,
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        patterns: Arc<RegistryPatterns>,
        verify_buffer_limit: u64,
    ) -> Self {
        Self::new(vec![
            Arc::new(FileMirror::new(
                scheme,
                store.clone(),
                blobs.clone(),
                verify_buffer_limit,
            )),
            Arc::new(ContainerMirror::new(scheme, store, blobs, patterns)),
        ])
    }

    pub async fn serve(&self, req: &MirrorRequest) -> Response<MirrorBody> {
        for link in &self.links {
            match link.serve(req).await {
                LinkOutcome::Handled(response) => {
                    debug!(
                        "{} link answered {} {}{} with {}",
                        link.name(),
                        req.method,
                        req.host,
                        req.path,
                        response.status()
                    );
                    return response;
                }
                LinkOutcome::Deferred => {
                    debug!(
                        "{} link deferred {} {}{}",
                        link.name(),
                        req.method,
                        req.host,
                        req.path
                    );
                }
                LinkOutcome::Failed(e) => {
                    let status = e.status();
                    if status.is_server_error() {
                        error!(
                            "{} link failed {} {}{}: {}",
                            link.name(),
                            req.method,
                            req.host,
                            req.path,
                            e
                        );
                    } else {
                        debug!(
                            "{} link refused {} {}{}: {}",
                            link.name(),
                            req.method,
                            req.host,
                            req.path,
                            e
                        );
                    }
                    return e.into_response();
                }
            }
        }
        not_found()
    }
}

#[async_trait]
impl RequestHandler for MirrorChain {
    async fn handle<B: Send + 'static>(&self, req: Request<B>) -> Response<MirrorBody> {
        self.serve(&MirrorRequest::from_request(&req)).await
    }
}

pub fn not_found() -> Response<MirrorBody> {
    body::text_response(StatusCode::NOT_FOUND, "404 page not found")
}
