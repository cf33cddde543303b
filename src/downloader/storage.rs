// Object storage - the artifact cache behind the CacheGate and Materializer
//
// Handles:
// - The `ObjectStore` trait (HEAD/PUT with user metadata)
// - Key derivation `<prefix>/<identifier>.<ext>`
// - An S3-compatible store using path-style URLs and AWS SigV4 signing

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use url::Url;

use super::config::StorageSection;
use super::errors::{ResolveError, ResolveResult};
use super::identifier::Identifier;

type HmacSha256 = Hmac<Sha256>;

const META_PREFIX: &str = "x-amz-meta-";
const SIGNING_ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// What a HEAD request reveals about a stored object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHead {
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    /// User metadata, keys without the transport prefix
    pub metadata: BTreeMap<String, String>,
}

/// Storage backend; implementations must be safe to share across pipelines
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the key does not exist
    async fn head(&self, key: &str) -> ResolveResult<Option<ObjectHead>>;

    /// Single-request upload; replaces any existing object. Returns the ETag.
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> ResolveResult<Option<String>>;

    /// URL under which the object is reachable
    fn object_url(&self, key: &str) -> String;
}

/// `<prefix>/<identifier>.<ext>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyScheme {
    prefix: String,
}

impl KeyScheme {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub fn key_for(&self, id: &Identifier, extension: &str) -> String {
        let extension = extension.trim_start_matches('.');
        if self.prefix.is_empty() {
            format!("{}.{}", id.as_str(), extension)
        } else {
            format!("{}/{}.{}", self.prefix, id.as_str(), extension)
        }
    }
}

impl Default for KeyScheme {
    fn default() -> Self {
        Self::new(&StorageSection::default().key_prefix)
    }
}

/// Static credentials for request signing
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl S3Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token: None,
        }
    }

    /// Read from the env var names configured in the storage section
    pub fn from_env(storage: &StorageSection) -> ResolveResult<Self> {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let access_key = read(&storage.access_key_env)
            .ok_or_else(|| ResolveError::Config(format!("{} is not set", storage.access_key_env)))?;
        let secret_key = read(&storage.secret_key_env)
            .ok_or_else(|| ResolveError::Config(format!("{} is not set", storage.secret_key_env)))?;
        Ok(Self {
            access_key,
            secret_key,
            session_token: read(&storage.session_token_env),
        })
    }
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// S3-compatible store (AWS, MinIO, R2) addressed path-style
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    endpoint: Url,
    bucket: String,
    region: String,
    public_base_url: Option<String>,
    credentials: S3Credentials,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl S3ObjectStore {
    pub fn new(storage: &StorageSection, credentials: S3Credentials) -> ResolveResult<Self> {
        let endpoint = Url::parse(&storage.endpoint)
            .map_err(|e| ResolveError::Config(format!("invalid storage endpoint {}: {}", storage.endpoint, e)))?;
        if storage.bucket.trim().is_empty() {
            return Err(ResolveError::Config("storage bucket is empty".to_string()));
        }
        let request_timeout = storage.request_timeout();
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| ResolveError::StorageUnavailable(format!("failed to build storage client: {}", e)))?;
        Ok(Self {
            endpoint,
            bucket: storage.bucket.trim().to_string(),
            region: storage.region.clone(),
            public_base_url: storage.public_base_url.clone(),
            credentials,
            request_timeout,
            client,
        })
    }

    pub fn from_config(storage: &StorageSection) -> ResolveResult<Self> {
        Self::new(storage, S3Credentials::from_env(storage)?)
    }

    fn canonical_uri(&self, key: &str) -> String {
        let base = self.endpoint.path().trim_end_matches('/');
        format!("{}/{}/{}", base, uri_encode(&self.bucket, false), uri_encode(key, true))
    }

    fn request_url(&self, canonical_uri: &str) -> String {
        let mut origin = format!("{}://{}", self.endpoint.scheme(), self.host_header());
        origin.push_str(canonical_uri);
        origin
    }

    fn host_header(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Signed headers for one request; `extra` must already be lowercase
    fn signed_headers(
        &self,
        method: &str,
        canonical_uri: &str,
        payload_hash: &str,
        extra: BTreeMap<String, String>,
    ) -> ResolveResult<BTreeMap<String, String>> {
        let (amz_date, _) = amz_timestamp(OffsetDateTime::now_utc());
        let mut headers = extra;
        headers.insert("host".to_string(), self.host_header());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        if let Some(token) = &self.credentials.session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }

        let authorization = sign_request(
            &self.credentials,
            &self.region,
            &SigningInput {
                method,
                canonical_uri,
                headers: &headers,
                payload_hash,
                amz_date: &amz_date,
            },
        )?;
        headers.insert("authorization".to_string(), authorization);
        // reqwest derives Host from the URL
        headers.remove("host");
        Ok(headers)
    }

    fn apply(builder: reqwest::RequestBuilder, headers: &BTreeMap<String, String>) -> reqwest::RequestBuilder {
        headers
            .iter()
            .fold(builder, |builder, (name, value)| builder.header(name.as_str(), value.as_str()))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn head(&self, key: &str) -> ResolveResult<Option<ObjectHead>> {
        let canonical_uri = self.canonical_uri(key);
        let headers = self.signed_headers("HEAD", &canonical_uri, &sha256_hex(b""), BTreeMap::new())?;
        let request = Self::apply(
            self.client
                .head(self.request_url(&canonical_uri))
                .timeout(self.request_timeout),
            &headers,
        );

        let response = request
            .send()
            .await
            .map_err(|e| ResolveError::StorageUnavailable(format!("HEAD {} failed: {}", key, e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let header = |name: &str| {
                    response
                        .headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                };
                let metadata = response
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| {
                        let key = name.as_str().strip_prefix(META_PREFIX)?;
                        Some((key.to_string(), value.to_str().ok()?.to_string()))
                    })
                    .collect();
                Ok(Some(ObjectHead {
                    size_bytes: header("content-length").and_then(|v| v.parse().ok()).unwrap_or(0),
                    etag: header("etag").map(|v| v.trim_matches('"').to_string()),
                    content_type: header("content-type"),
                    metadata,
                }))
            }
            status => Err(ResolveError::StorageUnavailable(format!(
                "HEAD {} returned HTTP {}",
                key,
                status.as_u16()
            ))),
        }
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> ResolveResult<Option<String>> {
        let canonical_uri = self.canonical_uri(key);
        let payload_hash = sha256_hex(&body);

        let mut extra = BTreeMap::new();
        extra.insert("content-type".to_string(), content_type.to_string());
        for (name, value) in metadata {
            extra.insert(
                format!("{}{}", META_PREFIX, sanitize_meta_key(name)),
                sanitize_meta_value(value),
            );
        }

        let headers = self.signed_headers("PUT", &canonical_uri, &payload_hash, extra)?;
        let request = Self::apply(self.client.put(self.request_url(&canonical_uri)), &headers).body(body);

        let response = request
            .send()
            .await
            .map_err(|e| ResolveError::StorageUnavailable(format!("PUT {} failed: {}", key, e)))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ResolveError::StorageUnavailable(format!(
                "PUT {} returned HTTP {}: {}",
                key,
                status.as_u16(),
                detail.chars().take(200).collect::<String>()
            )));
        }
        Ok(response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string()))
    }

    fn object_url(&self, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => self.request_url(&self.canonical_uri(key)),
        }
    }
}

/// Request parts covered by the signature
pub struct SigningInput<'a> {
    pub method: &'a str,
    pub canonical_uri: &'a str,
    /// Lowercase names; every entry is signed
    pub headers: &'a BTreeMap<String, String>,
    pub payload_hash: &'a str,
    pub amz_date: &'a str,
}

/// `Authorization` header value for an S3 request without query parameters
pub fn sign_request(credentials: &S3Credentials, region: &str, input: &SigningInput<'_>) -> ResolveResult<String> {
    let date = input.amz_date.get(..8).unwrap_or(input.amz_date);
    let scope = format!("{}/{}/s3/aws4_request", date, region);

    let canonical_headers: String = input
        .headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.split_whitespace().collect::<Vec<_>>().join(" ")))
        .collect();
    let signed_headers = input.headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        input.method, input.canonical_uri, canonical_headers, signed_headers, input.payload_hash
    );
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        SIGNING_ALGORITHM,
        input.amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac_sha256(format!("AWS4{}", credentials.secret_key).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, b"s3")?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

    Ok(format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        SIGNING_ALGORITHM, credentials.access_key, scope, signed_headers, signature
    ))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> ResolveResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ResolveError::Config(format!("invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// (`20130524T000000Z`, `20130524`)
fn amz_timestamp(now: OffsetDateTime) -> (String, String) {
    let date = format!("{:04}{:02}{:02}", now.year(), u8::from(now.month()), now.day());
    let stamp = format!("{}T{:02}{:02}{:02}Z", date, now.hour(), now.minute(), now.second());
    (stamp, date)
}

/// RFC 3986 encoding as SigV4 expects; `/` kept when `keep_slash`
fn uri_encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn sanitize_meta_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

/// Header-safe: visible ASCII, single spaces
fn sanitize_meta_value(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect()
}
