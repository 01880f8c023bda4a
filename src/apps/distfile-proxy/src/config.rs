use clap::Args;
use confique::Config;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::proxy::bridge::{BridgeConfig, OverflowPolicy};

/// Address of the plain HTTP listener when none is configured.
pub const DEFAULT_HTTP_BIND_ADDR: &str = "0.0.0.0:80";

#[derive(Config, Clone, Default, Serialize, Deserialize)]
#[config(layer_attr(derive(Args, Serialize, Clone)))]
pub struct AppConfig {
    #[config(nested, layer_attr(command(flatten)))]
    pub proxy: ProxyConfig,

    #[config(nested, layer_attr(command(flatten)))]
    pub db: DbConfig,

    #[config(nested, layer_attr(command(flatten)))]
    pub s3: S3Config,

    #[config(nested, layer_attr(command(flatten)))]
    pub tls: TlsConfig,

    #[config(nested, layer_attr(command(flatten)))]
    pub files: FilesConfig,
}

#[derive(Clone, Config, Deserialize, Serialize, Default)]
#[config(layer_attr(derive(Args, Clone, Serialize,)))]
pub struct ProxyConfig {
    /// The address the plain HTTP proxy listener binds to (defaults to 0.0.0.0:80)
    #[config(env = "PROXY_HTTP_BIND_ADDR", layer_attr(arg(long)))]
    pub http_bind_addr: Option<String>,

    /// How many hijacked connections may wait for the TLS server (0 means unbounded)
    #[config(
        default = 0,
        env = "PROXY_BRIDGE_CAPACITY",
        layer_attr(arg(long))
    )]
    pub bridge_capacity: usize,

    /// Refuse CONNECT tunnels instead of waiting when the bridge is full
    #[config(
        default = false,
        env = "PROXY_BRIDGE_REJECT_WHEN_FULL",
        layer_attr(arg(long))
    )]
    pub bridge_reject_when_full: bool,
}

impl ProxyConfig {
    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            capacity: (self.bridge_capacity > 0).then_some(self.bridge_capacity),
            overflow: if self.bridge_reject_when_full {
                OverflowPolicy::Reject
            } else {
                OverflowPolicy::Block
            },
        }
    }
}

#[derive(Clone, Config, Deserialize, Serialize, Default)]
#[config(layer_attr(derive(Args, Clone, Serialize,)))]
pub struct DbConfig {
    /// The metadata database URL (postgres://... or sqlite:...)
    #[config(env = "DB_ADDRESS", layer_attr(arg(long)))]
    pub db_address: String,
}

#[derive(Clone, Config, Deserialize, Serialize, Default)]
#[config(layer_attr(derive(Args, Clone, Serialize,)))]
pub struct S3Config {
    /// Access key of the S3 buckets holding mirrored content
    #[config(env = "S3_ACCESS_KEY_ID", layer_attr(arg(long)))]
    pub s3_access_key_id: String,

    /// Secret access key of the S3 buckets holding mirrored content
    #[config(env = "S3_SECRET_ACCESS_KEY", layer_attr(arg(long)))]
    pub s3_secret_access_key: String,

    /// Endpoint of the S3 service, with or without a scheme
    #[config(env = "S3_ENDPOINT", layer_attr(arg(long)))]
    pub s3_endpoint: String,

    /// Region of the S3 buckets
    #[config(env = "S3_REGION", layer_attr(arg(long)))]
    pub s3_region: String,

    /// Use plain HTTP for an endpoint given without a scheme
    #[config(default = false, env = "S3_DISABLE_SSL", layer_attr(arg(long)))]
    pub s3_disable_ssl: bool,
}

#[derive(Clone, Config, Deserialize, Serialize, Default)]
#[config(layer_attr(derive(Args, Clone, Serialize,)))]
pub struct TlsConfig {
    /// PEM root certificate used to sign intercepted hosts' certificates
    #[config(
        default = "/ca/tls.crt",
        env = "CA_CERT_PATH",
        layer_attr(arg(long))
    )]
    pub ca_cert_path: PathBuf,

    /// PEM RSA private key of the root certificate
    #[config(
        default = "/ca/tls.key",
        env = "CA_KEY_PATH",
        layer_attr(arg(long))
    )]
    pub ca_key_path: PathBuf,
}

#[derive(Clone, Config, Deserialize, Serialize, Default)]
#[config(layer_attr(derive(Args, Clone, Serialize,)))]
pub struct FilesConfig {
    /// Files up to this many bytes are checksummed before being served (0 disables)
    #[config(
        default = 1048576,
        env = "FILES_VERIFY_BUFFER_LIMIT",
        layer_attr(arg(long))
    )]
    pub verify_buffer_limit: u64,
}
