use crate::{AppConfig, CertificateAuthority, Db, ProxyServer, S3BlobStore};

use anyhow::{Context, Result};
use clap::Parser;
use confique::Config;
use std::{path::PathBuf, sync::Arc};
use tracing::info;

// Re-export PartialAppConfig for public usage
pub use crate::config::confique_app_config_layer::AppConfigLayer as PartialAppConfig;


#[derive(Parser)]
#[command(name = "dm-web-proxy")]
#[command(about = "Intercepting proxy serving mirrored container images and distfiles")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/distfile-mirror/proxy.toml")]
    config_path: PathBuf,

    /// Configuration object
    #[command(flatten)]
    config: PartialAppConfig,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let log_level = if self.verbose { "debug" } else { "info" };
        tracing_subscriber::fmt()
            .with_env_filter(format!("distfile_proxy={},{}", log_level, log_level))
            .init();

        let config = self.load_config()?;
        run_proxy(config).await
    }

    /// Flags take precedence over the environment, which takes precedence
    /// over the configuration file. A missing file is not an error.
    fn load_config(self) -> Result<AppConfig> {
        let config = AppConfig::builder()
            .preloaded(self.config)
            .env()
            .file(&self.config_path)
            .load()
            .with_context(|| format!("Invalid configuration ({:?})", self.config_path))?;
        Ok(config)
    }
}

/// Fails fast on unreadable CA material, an unreachable database or a bad
/// object store endpoint, then serves until Ctrl-C.
async fn run_proxy(config: AppConfig) -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let ca = CertificateAuthority::from_files(&config.tls.ca_cert_path, &config.tls.ca_key_path)
        .await
        .with_context(|| {
            format!(
                "Failed to load root certificate {:?} and key {:?}",
                config.tls.ca_cert_path, config.tls.ca_key_path
            )
        })?;
    info!("Certificate Authority initialized");

    let db = Db::connect(&config.db.db_address)
        .await
        .context("Failed to connect to the metadata database")?;

    let blobs = S3BlobStore::new(&config.s3).context("Failed to configure the S3 client")?;
    info!("Serving blobs from {:?}", blobs);

    let mut proxy = ProxyServer::new(Arc::new(ca), Arc::new(db), Arc::new(blobs), config);
    proxy.start().await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received Ctrl-C, shutting down");
        }
        _ = proxy.join() => {}
    }
    proxy.shutdown().await;

    Ok(())
}
