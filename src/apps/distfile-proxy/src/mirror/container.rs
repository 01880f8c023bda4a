use super::body::{self, MirrorBody};
use super::patterns::{RegistryPatterns, RegistryRoute};
use super::{LinkOutcome, MirrorError, MirrorLink, MirrorRequest};
use crate::blob::{BlobStore, CONTAINER_BLOBS_BUCKET, container_blob_key};
use crate::db::{ContainerRepository, MetadataStore};

use async_trait::async_trait;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::sync::Arc;
use tracing::debug;

/// Serves the read-only part of the Docker Registry HTTP API v2 for
/// registries the ingestion jobs have mirrored.
pub struct ContainerMirror {
    scheme: String,
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    patterns: Arc<RegistryPatterns>,
}

impl ContainerMirror {
    pub fn new(
        scheme: &str,
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        patterns: Arc<RegistryPatterns>,
    ) -> Self {
        Self {
            scheme: scheme.to_string(),
            store,
            blobs,
            patterns,
        }
    }

    fn registry_uri(&self, host: &str, prefix: &str) -> String {
        format!("{}://{}{}", self.scheme, host, prefix)
    }

    async fn find_repository(
        &self,
        host: &str,
        prefix: &str,
        repository_name: &str,
    ) -> Result<Option<ContainerRepository>, MirrorError> {
        let Some(registry) = self
            .store
            .find_registry(&self.registry_uri(host, prefix))
            .await?
        else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_repository(&registry, repository_name)
            .await?)
    }

    async fn ping(
        &self,
        req: &MirrorRequest,
        prefix: &str,
    ) -> Result<Option<Response<MirrorBody>>, MirrorError> {
        let uri = self.registry_uri(&req.host, prefix);
        if self.store.find_registry(&uri).await?.is_none() {
            return Ok(None);
        }
        let response = Response::builder()
            .status(StatusCode::OK)
            .header("Docker-Distribution-API-Version", "registry/2.0")
            .body(body::empty())?;
        Ok(Some(response))
    }

    async fn manifest(
        &self,
        req: &MirrorRequest,
        prefix: &str,
        repository: &str,
        reference: &str,
    ) -> Result<Option<Response<MirrorBody>>, MirrorError> {
        let Some(repository) = self.find_repository(&req.host, prefix, repository).await? else {
            return Ok(None);
        };
        let Some(image) = self.store.find_image(&repository, reference).await? else {
            return Ok(None);
        };
        let Some((mediatype, manifest)) = image.manifest() else {
            return Ok(None);
        };

        let response = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, mediatype)
            .header(CONTENT_LENGTH, manifest.len())
            .body(body::full(manifest.to_vec()))?;
        Ok(Some(response))
    }

    /// Blobs come from a store shared by every repository, so the digest is
    /// not checked against the repository's manifests.
    async fn blob(
        &self,
        req: &MirrorRequest,
        prefix: &str,
        repository: &str,
        digest: &str,
    ) -> Result<Option<Response<MirrorBody>>, MirrorError> {
        if self
            .find_repository(&req.host, prefix, repository)
            .await?
            .is_none()
        {
            return Ok(None);
        }

        let key = container_blob_key(digest);
        let object = self
            .blobs
            .get(CONTAINER_BLOBS_BUCKET, &key)
            .await?
            .ok_or(MirrorError::BlobNotFound {
                bucket: CONTAINER_BLOBS_BUCKET,
                key,
            })?;

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/octet-stream");
        if let Some(size) = object.size {
            response = response.header(CONTENT_LENGTH, size);
        }
        debug!("Streaming blob {} for {}", digest, repository);
        Ok(Some(response.body(body::stream(object.body))?))
    }
}

#[async_trait]
impl MirrorLink for ContainerMirror {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn serve(&self, req: &MirrorRequest) -> LinkOutcome {
        // Registry routes are matched on the decoded path, so an escaped
        // `sha256%3A...` reference names the same image as `sha256:...`.
        let path = match urlencoding::decode(&req.path) {
            Ok(path) => path,
            Err(e) => {
                debug!("Not a registry path {}: {}", req.path, e);
                return LinkOutcome::Deferred;
            }
        };
        let result = match self.patterns.classify(&path) {
            None => return LinkOutcome::Deferred,
            Some(RegistryRoute::Ping { prefix }) => self.ping(req, prefix).await,
            Some(RegistryRoute::Manifest {
                prefix,
                repository,
                reference,
            }) => self.manifest(req, prefix, repository, reference).await,
            Some(RegistryRoute::Blob {
                prefix,
                repository,
                digest,
            }) => self.blob(req, prefix, repository, digest).await,
        };
        result.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::test_utils::{
        MemoryBlobStore, create_db, seed_image, seed_registry, seed_repository,
    };
    use http_body_util::BodyExt;
    use hyper::{Method, Request};

    const MEDIATYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
    const MANIFEST: &[u8] = br#"{"schemaVersion":2,"layers":[]}"#;

    struct Fixture {
        link: ContainerMirror,
        blobs: Arc<MemoryBlobStore>,
        _temp_dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let (db, temp_dir) = create_db().await;
        seed_fixture(&db).await;
        let blobs = Arc::new(MemoryBlobStore::new());
        let link = ContainerMirror::new(
            "https",
            Arc::new(db),
            blobs.clone(),
            Arc::new(RegistryPatterns::new().unwrap()),
        );
        Fixture {
            link,
            blobs,
            _temp_dir: temp_dir,
        }
    }

    async fn seed_fixture(db: &Db) {
        let registry = seed_registry(db, "https://registry.test/").await;
        let repository = seed_repository(db, &registry, "library/alpine").await;
        seed_image(db, &repository, "sha256:ready", Some((MEDIATYPE, MANIFEST))).await;
        seed_image(db, &repository, "sha256:pending", None).await;

        let prefixed = seed_registry(db, "https://registry.test/mirror/").await;
        seed_repository(db, &prefixed, "grafana/grafana").await;
    }

    fn get(path: &str) -> MirrorRequest {
        MirrorRequest::from_request(
            &Request::builder()
                .method(Method::GET)
                .uri(format!("https://registry.test{}", path))
                .body(())
                .unwrap(),
        )
    }

    fn handled(outcome: LinkOutcome) -> Response<MirrorBody> {
        match outcome {
            LinkOutcome::Handled(response) => response,
            other => panic!("expected a response, got {:?}", other),
        }
    }

    async fn body_bytes(response: Response<MirrorBody>) -> bytes::Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_ping_known_registry() {
        let f = fixture().await;
        let response = handled(f.link.serve(&get("/v2/")).await);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["docker-distribution-api-version"],
            "registry/2.0"
        );
        assert!(body_bytes(response).await.is_empty());

        let response = handled(f.link.serve(&get("/mirror/v2/")).await);
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ping_unknown_registry_defers() {
        let f = fixture().await;
        assert!(matches!(
            f.link.serve(&get("/other/v2/")).await,
            LinkOutcome::Deferred
        ));
    }

    #[tokio::test]
    async fn test_manifest_round_trip() {
        let f = fixture().await;
        let response = handled(
            f.link
                .serve(&get("/v2/library/alpine/manifests/sha256:ready"))
                .await,
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], MEDIATYPE);
        assert_eq!(
            response.headers()[CONTENT_LENGTH],
            MANIFEST.len().to_string().as_str()
        );
        assert_eq!(body_bytes(response).await, MANIFEST);
    }

    #[tokio::test]
    async fn test_manifest_misses_defer() {
        let f = fixture().await;
        for path in [
            "/v2/library/alpine/manifests/sha256:pending",
            "/v2/library/alpine/manifests/sha256:unknown",
            "/v2/library/busybox/manifests/sha256:ready",
            "/unknown/v2/library/alpine/manifests/sha256:ready",
        ] {
            assert!(
                matches!(f.link.serve(&get(path)).await, LinkOutcome::Deferred),
                "{} should defer",
                path
            );
        }
    }

    #[tokio::test]
    async fn test_blob_is_streamed_from_shared_store() {
        let f = fixture().await;
        f.blobs
            .insert(CONTAINER_BLOBS_BUCKET, "sha256:layer", b"layer contents");

        let response = handled(
            f.link
                .serve(&get("/v2/library/alpine/blobs/sha256:layer"))
                .await,
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "application/octet-stream"
        );
        assert_eq!(response.headers()[CONTENT_LENGTH], "14");
        assert_eq!(body_bytes(response).await, "layer contents");

        // Any mirrored repository may serve any blob.
        let response = handled(
            f.link
                .serve(&get("/mirror/v2/grafana/grafana/blobs/sha256:layer"))
                .await,
        );
        assert_eq!(body_bytes(response).await, "layer contents");
    }

    #[tokio::test]
    async fn test_blob_without_reported_size_omits_content_length() {
        let f = fixture().await;
        f.blobs
            .insert_with_size(CONTAINER_BLOBS_BUCKET, "sha256:unsized", b"abc", None);
        let response = handled(
            f.link
                .serve(&get("/v2/library/alpine/blobs/sha256:unsized"))
                .await,
        );
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(body_bytes(response).await, "abc");
    }

    #[tokio::test]
    async fn test_blob_failures() {
        let f = fixture().await;
        f.blobs.fail(CONTAINER_BLOBS_BUCKET, "sha256:broken");

        match f
            .link
            .serve(&get("/v2/library/alpine/blobs/sha256:missing"))
            .await
        {
            LinkOutcome::Failed(e) => assert_eq!(e.status(), StatusCode::NOT_FOUND),
            other => panic!("unexpected outcome {:?}", other),
        }
        match f
            .link
            .serve(&get("/v2/library/alpine/blobs/sha256:broken"))
            .await
        {
            LinkOutcome::Failed(e) => {
                assert_eq!(e.status(), StatusCode::INTERNAL_SERVER_ERROR)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        // Unknown repositories never reach the blob store.
        assert!(matches!(
            f.link
                .serve(&get("/v2/library/busybox/blobs/sha256:broken"))
                .await,
            LinkOutcome::Deferred
        ));
    }

    #[tokio::test]
    async fn test_escaped_paths_are_decoded_before_matching() {
        let f = fixture().await;
        let response = handled(
            f.link
                .serve(&get("/v2/library/alpine/manifests/sha256%3Aready"))
                .await,
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, MANIFEST);

        let response = handled(
            f.link
                .serve(&get("/v2/library%2Falpine/manifests/sha256:ready"))
                .await,
        );
        assert_eq!(response.status(), StatusCode::OK);

        let response = handled(f.link.serve(&get("/%6Dirror/v2/")).await);
        assert_eq!(response.status(), StatusCode::OK);

        // Escapes that do not decode to UTF-8 cannot name a registry.
        assert!(matches!(
            f.link.serve(&get("/v2/library/alpine/manifests/%FF")).await,
            LinkOutcome::Deferred
        ));
    }

    #[tokio::test]
    async fn test_unrelated_paths_defer() {
        let f = fixture().await;
        assert!(matches!(
            f.link.serve(&get("/index.html")).await,
            LinkOutcome::Deferred
        ));
    }

    #[tokio::test]
    async fn test_plain_http_scheme_is_part_of_registry_identity() {
        let (db, _temp_dir) = create_db().await;
        seed_registry(&db, "https://registry.test/").await;
        let link = ContainerMirror::new(
            "http",
            Arc::new(db),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(RegistryPatterns::new().unwrap()),
        );
        let req = MirrorRequest::from_request(
            &Request::builder()
                .uri("http://registry.test/v2/")
                .body(())
                .unwrap(),
        );
        assert!(matches!(link.serve(&req).await, LinkOutcome::Deferred));
    }
}
