pub mod schema;

pub use schema::{ContainerImage, ContainerRegistry, ContainerRepository, File};

use async_trait::async_trait;
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use std::time::Duration;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("metadata store error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Read-only view of the mirror metadata. `Ok(None)` is a cache miss.
///
/// Ids are compared and returned as text: the ingestion schema may store
/// them as native UUIDs, which the `Any` driver cannot decode.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn find_registry(&self, uri: &str) -> Result<Option<ContainerRegistry>, StoreError>;

    async fn find_repository(
        &self,
        registry: &ContainerRegistry,
        repository_name: &str,
    ) -> Result<Option<ContainerRepository>, StoreError>;

    /// Only images whose manifest has been stored are returned.
    async fn find_image(
        &self,
        repository: &ContainerRepository,
        digest: &str,
    ) -> Result<Option<ContainerImage>, StoreError>;

    async fn find_present_file(&self, uri: &str) -> Result<Option<File>, StoreError>;
}

pub struct Db {
    pub pool: AnyPool,
}

impl Db {
    pub fn new(pool: AnyPool) -> Self {
        Db { pool }
    }

    /// Connects to `address`, a `postgres://` or `sqlite:` URL. The first
    /// connection is opened eagerly so an unreachable database fails startup.
    pub async fn connect(address: &str) -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(30))
            .connect(address)
            .await?;
        info!("Connected to metadata store");
        Ok(Db { pool })
    }
}

#[async_trait]
impl MetadataStore for Db {
    async fn find_registry(&self, uri: &str) -> Result<Option<ContainerRegistry>, StoreError> {
        let registry = sqlx::query_as::<_, ContainerRegistry>(
            "SELECT CAST(id AS TEXT) AS id, uri FROM container_registries WHERE uri = $1 LIMIT 1",
        )
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(registry)
    }

    async fn find_repository(
        &self,
        registry: &ContainerRegistry,
        repository_name: &str,
    ) -> Result<Option<ContainerRepository>, StoreError> {
        let repository = sqlx::query_as::<_, ContainerRepository>(
            "SELECT CAST(id AS TEXT) AS id, CAST(registry_id AS TEXT) AS registry_id, repository_name
             FROM container_repositories
             WHERE CAST(registry_id AS TEXT) = $1 AND repository_name = $2 LIMIT 1",
        )
        .bind(&registry.id)
        .bind(repository_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(repository)
    }

    async fn find_image(
        &self,
        repository: &ContainerRepository,
        digest: &str,
    ) -> Result<Option<ContainerImage>, StoreError> {
        let image = sqlx::query_as::<_, ContainerImage>(
            "SELECT CAST(id AS TEXT) AS id, CAST(repository_id AS TEXT) AS repository_id, digest,
                    manifest_mediatype, manifest
             FROM container_images
             WHERE CAST(repository_id AS TEXT) = $1 AND digest = $2 AND manifest IS NOT NULL
             LIMIT 1",
        )
        .bind(&repository.id)
        .bind(digest)
        .fetch_optional(&self.pool)
        .await?;
        Ok(image)
    }

    async fn find_present_file(&self, uri: &str) -> Result<Option<File>, StoreError> {
        let file = sqlx::query_as::<_, File>(
            "SELECT CAST(id AS TEXT) AS id, uri, sha256, size FROM files
             WHERE uri = $1 AND present = TRUE LIMIT 1",
        )
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(file)
    }
}
