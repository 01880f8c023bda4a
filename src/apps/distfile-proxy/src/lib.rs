// Library interface for the distfile mirror proxy
// This exposes the internal modules for testing and external use

pub mod blob;
pub mod cert;
pub mod cli;
pub mod config;
pub mod db;
pub mod mirror;
pub mod proxy;

#[cfg(test)]
pub mod test_utils;


// Re-export commonly used types for convenience
pub use blob::S3BlobStore;
pub use cert::CertificateAuthority;
pub use config::AppConfig;
pub use db::Db;
pub use proxy::ProxyServer;
