use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use reqwest::Certificate;
use reqwest::Proxy;

use crate::blob::{BlobError, BlobObject, BlobStore};
use crate::db::{ContainerImage, ContainerRegistry, ContainerRepository, Db, File};
use crate::{AppConfig, CertificateAuthority, ProxyServer};

pub const TEST_CA_CERT_PEM: &str = include_str!("fixtures/ca.crt");
pub const TEST_CA_KEY_PEM: &str = include_str!("fixtures/ca.key");
pub const TEST_CA_PKCS8_KEY_PEM: &str = include_str!("fixtures/ca.pkcs8.key");

/// Tables as created by the ingestion jobs, in types every sqlx backend can
/// decode.
const SCHEMA: &[&str] = &[
    "CREATE TABLE container_registries (
        id TEXT PRIMARY KEY,
        uri TEXT NOT NULL
    )",
    "CREATE TABLE container_repositories (
        id TEXT PRIMARY KEY,
        registry_id TEXT NOT NULL,
        repository_name TEXT NOT NULL
    )",
    "CREATE TABLE container_images (
        id TEXT PRIMARY KEY,
        repository_id TEXT NOT NULL,
        digest TEXT NOT NULL,
        manifest_mediatype TEXT,
        manifest BLOB
    )",
    "CREATE TABLE files (
        id TEXT PRIMARY KEY,
        uri TEXT NOT NULL,
        sha256 TEXT,
        size BIGINT,
        present BOOLEAN NOT NULL
    )",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

pub fn create_ca() -> CertificateAuthority {
    CertificateAuthority::from_pem(TEST_CA_CERT_PEM.as_bytes(), TEST_CA_KEY_PEM.as_bytes())
        .expect("fixture CA should parse")
}

pub async fn create_db() -> (Db, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let address = format!(
        "sqlite://{}?mode=rwc",
        temp_dir.path().join("mirror.db").display()
    );
    let db = Db::connect(&address).await.unwrap();
    for statement in SCHEMA {
        sqlx::query(statement).execute(&db.pool).await.unwrap();
    }
    (db, temp_dir)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub async fn seed_registry(db: &Db, uri: &str) -> ContainerRegistry {
    let registry = ContainerRegistry {
        id: new_id(),
        uri: uri.to_string(),
    };
    sqlx::query("INSERT INTO container_registries (id, uri) VALUES ($1, $2)")
        .bind(&registry.id)
        .bind(&registry.uri)
        .execute(&db.pool)
        .await
        .unwrap();
    registry
}

pub async fn seed_repository(
    db: &Db,
    registry: &ContainerRegistry,
    repository_name: &str,
) -> ContainerRepository {
    let repository = ContainerRepository {
        id: new_id(),
        registry_id: registry.id.clone(),
        repository_name: repository_name.to_string(),
    };
    sqlx::query(
        "INSERT INTO container_repositories (id, registry_id, repository_name) VALUES ($1, $2, $3)",
    )
    .bind(&repository.id)
    .bind(&repository.registry_id)
    .bind(&repository.repository_name)
    .execute(&db.pool)
    .await
    .unwrap();
    repository
}

/// `manifest` is `(media type, bytes)`; `None` leaves the image pending.
pub async fn seed_image(
    db: &Db,
    repository: &ContainerRepository,
    digest: &str,
    manifest: Option<(&str, &[u8])>,
) -> ContainerImage {
    let image = ContainerImage {
        id: new_id(),
        repository_id: repository.id.clone(),
        digest: digest.to_string(),
        manifest_mediatype: manifest.map(|(mediatype, _)| mediatype.to_string()),
        manifest: manifest.map(|(_, bytes)| bytes.to_vec()),
    };
    sqlx::query(
        "INSERT INTO container_images (id, repository_id, digest, manifest_mediatype, manifest)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(&image.id)
    .bind(&image.repository_id)
    .bind(&image.digest)
    .bind(image.manifest_mediatype.clone())
    .bind(image.manifest.clone())
    .execute(&db.pool)
    .await
    .unwrap();
    image
}

/// `content` is `(sha256, size)`; `None` leaves both unset.
pub async fn seed_file(db: &Db, uri: &str, content: Option<(&str, i64)>, present: bool) -> File {
    let file = File {
        id: new_id(),
        uri: uri.to_string(),
        sha256: content.map(|(sha256, _)| sha256.to_string()),
        size: content.map(|(_, size)| size),
    };
    sqlx::query("INSERT INTO files (id, uri, sha256, size, present) VALUES ($1, $2, $3, $4, $5)")
        .bind(&file.id)
        .bind(&file.uri)
        .bind(file.sha256.clone())
        .bind(file.size)
        .bind(present)
        .execute(&db.pool)
        .await
        .unwrap();
    file
}

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    size: Option<u64>,
}

/// In-memory blob store. Objects are returned in small chunks so consumers
/// see a real stream.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    failing: Mutex<HashSet<(String, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, data: &[u8]) {
        self.insert_with_size(bucket, key, data, Some(data.len() as u64));
    }

    /// Stores `data` but reports `size` to readers.
    pub fn insert_with_size(&self, bucket: &str, key: &str, data: &[u8], size: Option<u64>) {
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: Bytes::copy_from_slice(data),
                size,
            },
        );
    }

    /// Makes reads of `key` fail like an unavailable backend.
    pub fn fail(&self, bucket: &str, key: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()));
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<BlobObject>, BlobError> {
        let id = (bucket.to_string(), key.to_string());
        if self.failing.lock().unwrap().contains(&id) {
            return Err(BlobError::Backend {
                status: 503,
                body: "SlowDown".to_string(),
            });
        }
        let Some(object) = self.objects.lock().unwrap().get(&id).cloned() else {
            return Ok(None);
        };

        let chunks: Vec<Result<Bytes, BlobError>> = object
            .data
            .chunks(7)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(Some(BlobObject {
            size: object.size,
            body: stream::iter(chunks).boxed(),
        }))
    }
}

/// A proxy bound to an OS-assigned port on localhost, backed by a fresh
/// SQLite database and an in-memory blob store.
pub struct TestProxy {
    pub proxy: ProxyServer,
    pub ca: Arc<CertificateAuthority>,
    pub db: Arc<Db>,
    pub blobs: Arc<MemoryBlobStore>,
    _temp_dir: tempfile::TempDir,
}

impl TestProxy {
    pub fn proxy_url(&self) -> String {
        format!("http://{}", self.proxy.listen_addr().unwrap())
    }

    pub fn client(&self, proto: Protocol) -> reqwest::Client {
        create_client(&self.ca, &self.proxy_url(), proto)
    }
}

pub async fn create_proxy_server() -> TestProxy {
    install_crypto_provider();
    let ca = Arc::new(create_ca());
    let (db, temp_dir) = create_db().await;
    let db = Arc::new(db);
    let blobs = Arc::new(MemoryBlobStore::new());

    let mut config = AppConfig::default();
    config.proxy.http_bind_addr = Some("127.0.0.1:0".to_string());
    config.files.verify_buffer_limit = 1024;

    let mut proxy = ProxyServer::new(ca.clone(), db.clone(), blobs.clone(), config);
    proxy.start().await.unwrap();

    TestProxy {
        proxy,
        ca,
        db,
        blobs,
        _temp_dir: temp_dir,
    }
}

pub fn create_client(ca: &CertificateAuthority, proxy: &str, proto: Protocol) -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    builder = match proto {
        Protocol::Http1 => builder.http1_only(),
        Protocol::Http2 => builder.http2_prior_knowledge(),
    };

    let proxy_config = Proxy::all(proxy).unwrap();

    builder
        .add_root_certificate(Certificate::from_der(ca.root_certificate_der()).unwrap())
        .proxy(proxy_config)
        .default_headers({
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(
                reqwest::header::USER_AGENT,
                "distfile-proxy-test/1.0".parse().unwrap(),
            );
            headers
        })
        .build()
        .unwrap()
}
