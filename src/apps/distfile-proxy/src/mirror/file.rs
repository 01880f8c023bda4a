use super::body::{self, MirrorBody, SizeCheckedStream};
use super::{LinkOutcome, MirrorError, MirrorLink, MirrorRequest};
use crate::blob::{BlobObject, BlobStore, FILES_BUCKET, file_blob_key};
use crate::db::MetadataStore;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use ring::digest;
use std::sync::Arc;
use tracing::{debug, warn};

/// Upper bound on what [`read_verified`] reserves up front. The recorded size
/// comes from the metadata store, so the buffer only grows past this as bytes
/// actually arrive.
const INITIAL_BUFFER_CAPACITY: u64 = 64 * 1024;

/// Serves single files mirrored under the exact URI a client requests them
/// by.
///
/// Files no larger than `verify_buffer_limit` are read completely and
/// checked against the recorded size and SHA-256 before the response starts,
/// so a corrupt cache entry turns into a 500. Larger files are streamed and
/// only their size is checked, after the fact. A limit of 0 streams
/// everything.
pub struct FileMirror {
    scheme: String,
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    verify_buffer_limit: u64,
}

impl FileMirror {
    pub fn new(
        scheme: &str,
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        verify_buffer_limit: u64,
    ) -> Self {
        Self {
            scheme: scheme.to_string(),
            store,
            blobs,
            verify_buffer_limit,
        }
    }

    async fn serve_file(
        &self,
        req: &MirrorRequest,
    ) -> Result<Option<Response<MirrorBody>>, MirrorError> {
        let uri = req.source_uri(&self.scheme);
        let Some(file) = self.store.find_present_file(&uri).await? else {
            return Ok(None);
        };

        if req.method != Method::GET {
            return Err(MirrorError::MethodNotAllowed);
        }

        let Some((sha256, size)) = file.content_identity() else {
            warn!("File {} is marked present but has no checksum or size", uri);
            return Ok(None);
        };

        let key = file_blob_key(sha256, size);
        let object = self
            .blobs
            .get(FILES_BUCKET, &key)
            .await?
            .ok_or(MirrorError::BlobNotFound {
                bucket: FILES_BUCKET,
                key,
            })?;

        let body = if self.verify_buffer_limit > 0 && size <= self.verify_buffer_limit {
            body::full(read_verified(object, &uri, sha256, size).await?)
        } else {
            debug!("Streaming {} ({} bytes) without checksum verification", uri, size);
            body::stream(SizeCheckedStream::new(object.body, uri, size))
        };

        let response = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_LENGTH, size)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)?;
        Ok(Some(response))
    }
}

/// Reads the whole object and checks it against the recorded identity.
/// Reading stops as soon as the object grows past `size`.
async fn read_verified(
    object: BlobObject,
    uri: &str,
    sha256: &str,
    size: u64,
) -> Result<Bytes, MirrorError> {
    let mut body = object.body;
    let mut buf = BytesMut::with_capacity(size.min(INITIAL_BUFFER_CAPACITY) as usize);
    while let Some(chunk) = body.try_next().await? {
        let actual = (buf.len() + chunk.len()) as u64;
        if actual > size {
            return Err(MirrorError::SizeMismatch {
                uri: uri.to_string(),
                expected: size,
                actual,
            });
        }
        buf.extend_from_slice(&chunk);
    }

    if buf.len() as u64 != size {
        return Err(MirrorError::SizeMismatch {
            uri: uri.to_string(),
            expected: size,
            actual: buf.len() as u64,
        });
    }

    let actual = hex::encode(digest::digest(&digest::SHA256, &buf));
    if !actual.eq_ignore_ascii_case(sha256) {
        return Err(MirrorError::ChecksumMismatch {
            uri: uri.to_string(),
            expected: sha256.to_string(),
            actual,
        });
    }
    Ok(buf.freeze())
}

#[async_trait]
impl MirrorLink for FileMirror {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn serve(&self, req: &MirrorRequest) -> LinkOutcome {
        self.serve_file(req).await.into()
    }
}
