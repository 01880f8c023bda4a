use super::{BlobError, BlobObject, BlobStore};
use crate::config::S3Config;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use ring::{digest, hmac};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// SHA-256 of an empty request body.
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

/// Read-only S3 client using path-style addressing and Signature Version 4.
pub struct S3BlobStore {
    client: reqwest::Client,
    endpoint: Url,
    host: String,
    access_key_id: String,
    secret_access_key: String,
    region: String,
}

impl std::fmt::Debug for S3BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3BlobStore")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3BlobStore {
    pub fn new(config: &S3Config) -> Result<Self, BlobError> {
        let endpoint = resolve_endpoint(&config.s3_endpoint, config.s3_disable_ssl)?;
        let host = host_header(&endpoint)?;

        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            host,
            access_key_id: config.s3_access_key_id.clone(),
            secret_access_key: config.s3_secret_access_key.clone(),
            region: config.s3_region.clone(),
        })
    }

    fn object_path(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.path().trim_end_matches('/'),
            uri_encode(bucket, true),
            uri_encode(key, false)
        )
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<BlobObject>, BlobError> {
        let path = self.object_path(bucket, key);
        let url = format!("{}://{}{}", self.endpoint.scheme(), self.host, path);
        let amz_date = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let authorization = authorization(
            &self.access_key_id,
            &self.secret_access_key,
            &self.region,
            "GET",
            &path,
            &self.host,
            &amz_date,
        );

        let resp = self
            .client
            .get(&url)
            .header("x-amz-date", &amz_date)
            .header("x-amz-content-sha256", EMPTY_PAYLOAD_SHA256)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            debug!("Object {}/{} not found", bucket, key);
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BlobError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Some(BlobObject {
            size: resp.content_length(),
            body: resp.bytes_stream().map_err(BlobError::from).boxed(),
        }))
    }
}

/// Accepts either a full URL or a bare `host[:port]`, in which case the
/// scheme follows `disable_ssl`.
fn resolve_endpoint(endpoint: &str, disable_ssl: bool) -> Result<Url, BlobError> {
    let endpoint = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        let scheme = if disable_ssl { "http" } else { "https" };
        format!("{}://{}", scheme, endpoint)
    };
    let url = Url::parse(&endpoint).map_err(|e| BlobError::InvalidEndpoint(e.to_string()))?;
    if url.host_str().is_none() {
        return Err(BlobError::InvalidEndpoint(format!("{} has no host", endpoint)));
    }
    Ok(url)
}

fn host_header(url: &Url) -> Result<String, BlobError> {
    let host = url
        .host_str()
        .ok_or_else(|| BlobError::InvalidEndpoint(format!("{} has no host", url)))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Percent-encodes everything but RFC 3986 unreserved characters, as SigV4
/// requires. `/` is kept unless `encode_slash` is set.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

fn signing_key(secret_access_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_access_key).as_bytes(),
        date.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Builds the `Authorization` header for a body-less request signed over
/// `host`, `x-amz-content-sha256` and `x-amz-date`. `canonical_path` must
/// already be URI-encoded.
fn authorization(
    access_key_id: &str,
    secret_access_key: &str,
    region: &str,
    method: &str,
    canonical_path: &str,
    host: &str,
    amz_date: &str,
) -> String {
    let date = &amz_date[..8];
    let scope = format!("{}/{}/s3/aws4_request", date, region);

    let canonical_request = format!(
        "{method}\n{canonical_path}\n\nhost:{host}\nx-amz-content-sha256:{EMPTY_PAYLOAD_SHA256}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{EMPTY_PAYLOAD_SHA256}"
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(digest::digest(&digest::SHA256, canonical_request.as_bytes()))
    );

    let key = signing_key(secret_access_key, date, region, "s3");
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        access_key_id, scope, SIGNED_HEADERS, signature
    )
}
