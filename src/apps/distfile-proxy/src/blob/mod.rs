//! Content-addressed object storage holding mirrored payloads.
//!
//! Keys are derived from metadata alone so an object can be located without
//! listing: container blobs are keyed by their digest, files by
//! `"<sha256>|<size>"`.

pub mod s3;

pub use s3::S3BlobStore;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub const CONTAINER_BLOBS_BUCKET: &str = "container-blobs";
pub const FILES_BUCKET: &str = "files";

pub fn container_blob_key(digest: &str) -> String {
    digest.to_string()
}

pub fn file_blob_key(sha256: &str, size: u64) -> String {
    format!("{}|{}", sha256, size)
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("object store request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("object store answered {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("invalid object store endpoint: {0}")]
    InvalidEndpoint(String),
}

pub type BlobStream = BoxStream<'static, Result<Bytes, BlobError>>;

/// An object opened for reading. The body has not been read yet.
pub struct BlobObject {
    /// Size reported by the store, if any.
    pub size: Option<u64>,
    pub body: BlobStream,
}

impl std::fmt::Debug for BlobObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobObject")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Opens `key` in `bucket`. `Ok(None)` means the store has no such object.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<BlobObject>, BlobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_derived_from_metadata() {
        assert_eq!(
            container_blob_key("sha256:4bcff63911fcb4448bd4fdacec207030997caf25e9bea4045fa6c8c44de311d1"),
            "sha256:4bcff63911fcb4448bd4fdacec207030997caf25e9bea4045fa6c8c44de311d1"
        );
        assert_eq!(
            file_blob_key("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855", 0),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855|0"
        );
        assert_eq!(file_blob_key("abc", 1048576), "abc|1048576");
    }
}
