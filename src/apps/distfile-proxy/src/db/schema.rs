//! Rows written by the ingestion jobs. The proxy only ever reads them.

use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ContainerRegistry {
    pub id: String,
    /// Registry base URI, e.g. `https://index.docker.io/`.
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ContainerRepository {
    pub id: String,
    pub registry_id: String,
    /// Name within the registry, e.g. `library/mysql`.
    pub repository_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ContainerImage {
    pub id: String,
    pub repository_id: String,
    /// Typically `sha256:...`.
    pub digest: String,
    /// Only set once the image has been mirrored.
    pub manifest_mediatype: Option<String>,
    /// Only set once the image has been mirrored.
    pub manifest: Option<Vec<u8>>,
}

impl ContainerImage {
    /// Manifest media type and bytes, if both have been stored.
    pub fn manifest(&self) -> Option<(&str, &[u8])> {
        match (&self.manifest_mediatype, &self.manifest) {
            (Some(mediatype), Some(manifest)) => Some((mediatype.as_str(), manifest.as_slice())),
            _ => None,
        }
    }
}

/// A file recorded as present. Presence is filtered on by the query, not
/// decoded, since SQLite has no native boolean.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct File {
    pub id: String,
    pub uri: String,
    /// Empty until the file has been downloaded.
    pub sha256: Option<String>,
    /// Empty until the file has been downloaded.
    pub size: Option<i64>,
}

impl File {
    /// Checksum and size, if both are known and the size is sane.
    pub fn content_identity(&self) -> Option<(&str, u64)> {
        let sha256 = self.sha256.as_deref()?;
        let size = u64::try_from(self.size?).ok()?;
        Some((sha256, size))
    }
}
