#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use medrec_kernel_contracts::evidence::ContentId;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const FILE_GATEWAY_MAX_FILE_BYTES_DEFAULT: usize = 16 * 1024 * 1024;
pub const FILE_GATEWAY_MAX_FILE_BYTES_CEILING: usize = 64 * 1024 * 1024;
pub const IPFS_CONNECT_TIMEOUT_MS_DEFAULT: u64 = 3_000;
pub const IPFS_REQUEST_TIMEOUT_MS_DEFAULT: u64 = 10_000;

const CONTENT_ID_SHA256_PREFIX: &str = "sha256-";
const MULTIPART_BOUNDARY_PREFIX: &str = "medrec-evidence-";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("blob store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("blob store rejected payload: {reason}")]
    Rejected { reason: String },
    #[error("content id {content_id} not found")]
    NotFound { content_id: String },
}

impl GatewayError {
    /// Only reachability problems are worth another attempt; a rejection is a
    /// property of the payload.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable { .. })
    }
}

/// Backing content-addressed store. Implementations do not retry.
pub trait BlobStore: Send + Sync + fmt::Debug {
    fn backend_label(&self) -> &'static str;
    fn put(&self, bytes: &[u8]) -> Result<ContentId, GatewayError>;
    fn get(&self, content_id: &ContentId) -> Result<Vec<u8>, GatewayError>;
}

/// `sha256-<hex>` of the bytes; a pure function of content.
pub fn sha256_content_id(bytes: &[u8]) -> Result<ContentId, GatewayError> {
    let digest = hex::encode(Sha256::digest(bytes));
    ContentId::new(format!("{CONTENT_ID_SHA256_PREFIX}{digest}")).map_err(|v| {
        GatewayError::Rejected {
            reason: format!("content id: {v}"),
        }
    })
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<BTreeMap<ContentId, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }
}

impl BlobStore for InMemoryBlobStore {
    fn backend_label(&self) -> &'static str {
        "in_memory"
    }

    fn put(&self, bytes: &[u8]) -> Result<ContentId, GatewayError> {
        let content_id = sha256_content_id(bytes)?;
        let mut blobs = self.blobs.lock().map_err(|_| GatewayError::Unavailable {
            reason: "in-memory blob store lock poisoned".to_string(),
        })?;
        blobs
            .entry(content_id.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(content_id)
    }

    fn get(&self, content_id: &ContentId) -> Result<Vec<u8>, GatewayError> {
        let blobs = self.blobs.lock().map_err(|_| GatewayError::Unavailable {
            reason: "in-memory blob store lock poisoned".to_string(),
        })?;
        blobs
            .get(content_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound {
                content_id: content_id.as_str().to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpfsHttpBlobStoreConfig {
    pub api_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_fetch_bytes: usize,
}

impl IpfsHttpBlobStoreConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            connect_timeout_ms: IPFS_CONNECT_TIMEOUT_MS_DEFAULT,
            request_timeout_ms: IPFS_REQUEST_TIMEOUT_MS_DEFAULT,
            max_fetch_bytes: FILE_GATEWAY_MAX_FILE_BYTES_CEILING,
        }
    }

    pub fn from_env() -> Option<Self> {
        let api_url = env::var("MEDREC_IPFS_API_URL").ok()?;
        let api_url = api_url.trim().to_string();
        if api_url.is_empty() {
            return None;
        }
        Some(Self {
            api_url,
            connect_timeout_ms: parse_bounded_u64(
                env::var("MEDREC_IPFS_CONNECT_TIMEOUT_MS").ok().as_deref(),
                100..=60_000,
                IPFS_CONNECT_TIMEOUT_MS_DEFAULT,
            ),
            request_timeout_ms: parse_bounded_u64(
                env::var("MEDREC_IPFS_REQUEST_TIMEOUT_MS").ok().as_deref(),
                100..=120_000,
                IPFS_REQUEST_TIMEOUT_MS_DEFAULT,
            ),
            max_fetch_bytes: FILE_GATEWAY_MAX_FILE_BYTES_CEILING,
        })
    }
}

pub fn parse_bounded_u64(
    raw: Option<&str>,
    bounds: std::ops::RangeInclusive<u64>,
    default: u64,
) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| bounds.contains(v))
        .unwrap_or(default)
}

#[derive(Debug, serde::Deserialize)]
struct IpfsAddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

/// Kubo-compatible HTTP API client (`/api/v0/add`, `/api/v0/cat`).
pub struct IpfsHttpBlobStore {
    config: IpfsHttpBlobStoreConfig,
    agent: ureq::Agent,
    add_url: Url,
    cat_url: Url,
}

impl fmt::Debug for IpfsHttpBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpfsHttpBlobStore")
            .field("config", &self.config)
            .finish()
    }
}

impl IpfsHttpBlobStore {
    pub fn new(config: IpfsHttpBlobStoreConfig) -> Result<Self, GatewayError> {
        let base = Url::parse(&config.api_url).map_err(|err| GatewayError::Unavailable {
            reason: format!("invalid ipfs api url: {err}"),
        })?;
        let add_url = api_endpoint(&base, "api/v0/add");
        let cat_url = api_endpoint(&base, "api/v0/cat");
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
            .timeout_read(Duration::from_millis(config.request_timeout_ms))
            .timeout_write(Duration::from_millis(config.request_timeout_ms))
            .build();
        Ok(Self {
            config,
            agent,
            add_url,
            cat_url,
        })
    }
}

fn api_endpoint(base: &Url, tail: &str) -> Url {
    let mut url = base.clone();
    let path = format!("{}/{}", base.path().trim_end_matches('/'), tail);
    url.set_path(&path);
    url.set_query(None);
    url
}

fn multipart_boundary(bytes: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    format!("{MULTIPART_BOUNDARY_PREFIX}{}", &digest[..24])
}

pub(crate) fn multipart_file_body(boundary: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"file\"; filename=\"evidence\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

impl BlobStore for IpfsHttpBlobStore {
    fn backend_label(&self) -> &'static str {
        "ipfs_http"
    }

    fn put(&self, bytes: &[u8]) -> Result<ContentId, GatewayError> {
        let boundary = multipart_boundary(bytes);
        let body = multipart_file_body(&boundary, bytes);
        let resp = self
            .agent
            .post(self.add_url.as_str())
            .set(
                "content-type",
                &format!("multipart/form-data; boundary={boundary}"),
            )
            .send_bytes(&body);
        match resp {
            Ok(resp) => {
                let parsed: IpfsAddResponse =
                    resp.into_json().map_err(|err| GatewayError::Unavailable {
                        reason: format!("ipfs add response unreadable: {err}"),
                    })?;
                ContentId::new(parsed.hash).map_err(|v| GatewayError::Rejected {
                    reason: format!("ipfs returned unusable content id: {v}"),
                })
            }
            Err(ureq::Error::Status(code, _)) if (400..500).contains(&code) => {
                Err(GatewayError::Rejected {
                    reason: format!("ipfs add failed with http status {code}"),
                })
            }
            Err(ureq::Error::Status(code, _)) => Err(GatewayError::Unavailable {
                reason: format!("ipfs add failed with http status {code}"),
            }),
            Err(ureq::Error::Transport(err)) => Err(GatewayError::Unavailable {
                reason: format!("ipfs transport error: {err}"),
            }),
        }
    }

    fn get(&self, content_id: &ContentId) -> Result<Vec<u8>, GatewayError> {
        let mut url = self.cat_url.clone();
        url.query_pairs_mut().append_pair("arg", content_id.as_str());
        match self.agent.post(url.as_str()).call() {
            Ok(resp) => {
                let mut out = Vec::new();
                resp.into_reader()
                    .take(self.config.max_fetch_bytes as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|err| GatewayError::Unavailable {
                        reason: format!("ipfs cat read failed: {err}"),
                    })?;
                if out.len() > self.config.max_fetch_bytes {
                    return Err(GatewayError::Rejected {
                        reason: "ipfs cat payload exceeds max_fetch_bytes".to_string(),
                    });
                }
                Ok(out)
            }
            // Kubo reports unresolvable paths as 500 with an error body.
            Err(ureq::Error::Status(code, _)) if code == 404 || code == 500 => {
                Err(GatewayError::NotFound {
                    content_id: content_id.as_str().to_string(),
                })
            }
            Err(ureq::Error::Status(code, _)) => Err(GatewayError::Unavailable {
                reason: format!("ipfs cat failed with http status {code}"),
            }),
            Err(ureq::Error::Transport(err)) => Err(GatewayError::Unavailable {
                reason: format!("ipfs transport error: {err}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileGatewayConfig {
    pub max_file_bytes: usize,
}

impl FileGatewayConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_file_bytes: FILE_GATEWAY_MAX_FILE_BYTES_DEFAULT,
        }
    }

    pub fn from_env() -> Self {
        let max_file_bytes = parse_bounded_u64(
            env::var("MEDREC_MAX_FILE_BYTES").ok().as_deref(),
            1..=FILE_GATEWAY_MAX_FILE_BYTES_CEILING as u64,
            FILE_GATEWAY_MAX_FILE_BYTES_DEFAULT as u64,
        ) as usize;
        Self { max_file_bytes }
    }
}

/// Content-addressed file gateway: size policy in front of a [`BlobStore`].
#[derive(Debug, Clone)]
pub struct FileGateway {
    config: FileGatewayConfig,
    blob_store: Arc<dyn BlobStore>,
}

impl FileGateway {
    pub fn new(config: FileGatewayConfig, blob_store: Arc<dyn BlobStore>) -> Self {
        Self { config, blob_store }
    }

    pub fn in_memory() -> Self {
        Self::new(FileGatewayConfig::mvp_v1(), Arc::new(InMemoryBlobStore::new()))
    }

    /// In-memory unless `MEDREC_IPFS_API_URL` is set.
    pub fn from_env() -> Result<Self, GatewayError> {
        let config = FileGatewayConfig::from_env();
        match IpfsHttpBlobStoreConfig::from_env() {
            Some(ipfs) => Ok(Self::new(config, Arc::new(IpfsHttpBlobStore::new(ipfs)?))),
            None => Ok(Self::new(config, Arc::new(InMemoryBlobStore::new()))),
        }
    }

    pub fn backend_label(&self) -> &'static str {
        self.blob_store.backend_label()
    }

    pub fn store(&self, bytes: &[u8]) -> Result<ContentId, GatewayError> {
        if bytes.len() > self.config.max_file_bytes {
            return Err(GatewayError::Rejected {
                reason: format!(
                    "file of {} bytes exceeds max_file_bytes {}",
                    bytes.len(),
                    self.config.max_file_bytes
                ),
            });
        }
        match self.blob_store.put(bytes) {
            Ok(content_id) => {
                debug!(
                    backend = self.backend_label(),
                    content_id = content_id.as_str(),
                    size = bytes.len(),
                    "file stored"
                );
                Ok(content_id)
            }
            Err(err) => {
                warn!(backend = self.backend_label(), error = %err, "file store failed");
                Err(err)
            }
        }
    }

    pub fn fetch(&self, content_id: &ContentId) -> Result<Vec<u8>, GatewayError> {
        self.blob_store.get(content_id)
    }
}
