//! Remote module fetching with an origin allowlist.
//!
//! Security model:
//! - Only URLs matching allowed origins can be fetched
//! - Redirects only followed if they stay within the same origin
//! - Responses are capped in size and must be UTF-8
//! - Successful responses may be cached by URL; failures never are

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

/// Default per-module size cap (10 MiB).
pub const MAX_MODULE_BYTES: usize = 10 * 1024 * 1024;

/// Default number of same-origin redirects followed.
pub const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Fetch blocked: origin '{origin}' is not in the allowlist. Allowed: {allowed:?}")]
    Blocked { origin: String, allowed: Vec<String> },

    #[error("Fetch blocked: redirect to different origin '{to}' (original: '{from}')")]
    CrossOriginRedirect { from: String, to: String },

    #[error("Too many redirects while fetching {url}")]
    TooManyRedirects { url: String },

    #[error("Invalid redirect from {url}: {reason}")]
    InvalidRedirect { url: String, reason: String },

    #[error("HTTP {status} for URL: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Module too large: {url} exceeds {max} bytes")]
    TooLarge { url: String, max: usize },

    #[error("Module is not valid UTF-8: {url}")]
    NotUtf8 { url: String },

    #[error("Integrity mismatch for {url}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("Unsupported integrity format '{0}' (expected sha256-<base64>)")]
    UnsupportedIntegrity(String),
}

/// Configuration for fetch allowlist
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Allowed origins (e.g., "https://esm.sh")
    /// An origin is scheme + host + port
    pub allowed_origins: Vec<String>,
    /// Maximum accepted module size in bytes
    pub max_module_bytes: usize,
    /// Maximum same-origin redirects followed per fetch
    pub max_redirects: usize,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![crate::import_map::DEFAULT_REMOTE_ORIGIN.to_string()],
            max_module_bytes: MAX_MODULE_BYTES,
            max_redirects: MAX_REDIRECTS,
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl FetchConfig {
    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        if self.allowed_origins.is_empty() {
            return false;
        }
        let origin = url.origin().ascii_serialization();
        self.allowed_origins
            .iter()
            .any(|allowed| origin == allowed.trim_end_matches('/'))
    }
}

/// Source text of a fetched module.
#[derive(Debug, Clone)]
pub struct FetchedModule {
    /// Final URL after redirects; relative imports resolve against it.
    pub url: Url,
    pub source: Arc<str>,
    /// `sha256-<base64>` digest of `source`.
    pub integrity: String,
}

impl FetchedModule {
    pub fn new(url: Url, source: impl Into<Arc<str>>) -> Self {
        let source = source.into();
        let integrity = integrity_of(source.as_bytes());
        Self { url, source, integrity }
    }

    /// Check `expected` (`sha256-<base64>`) against the fetched content.
    pub fn verify(&self, expected: &str) -> Result<(), FetchError> {
        if !expected.starts_with("sha256-") {
            return Err(FetchError::UnsupportedIntegrity(expected.to_string()));
        }
        if self.integrity != expected {
            return Err(FetchError::IntegrityMismatch {
                url: self.url.to_string(),
                expected: expected.to_string(),
                actual: self.integrity.clone(),
            });
        }
        Ok(())
    }
}

/// Compute an SRI-style `sha256-<base64>` digest.
pub fn integrity_of(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!(
        "sha256-{}",
        base64::engine::general_purpose::STANDARD.encode(digest)
    )
}

/// Retrieves module source for a URL. Compilation suspends on this.
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedModule, FetchError>;
}

/// reqwest-backed fetcher enforcing [`FetchConfig`].
pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            // Don't follow redirects automatically - we'll handle them manually
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.request_timeout)
            .user_agent(concat!("component-ssr/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    async fn read_body(&self, url: &Url, mut response: reqwest::Response) -> Result<String, FetchError> {
        let max = self.config.max_module_bytes;
        if response.content_length().is_some_and(|len| len as usize > max) {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                max,
            });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > max {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    max,
                });
            }
            body.extend_from_slice(&chunk);
        }

        String::from_utf8(body).map_err(|_| FetchError::NotUtf8 { url: url.to_string() })
    }
}

#[async_trait]
impl ModuleFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedModule, FetchError> {
        let origin = url.origin();
        let mut current = url.clone();

        for _ in 0..=self.config.max_redirects {
            if !self.config.is_origin_allowed(&current) {
                return Err(FetchError::Blocked {
                    origin: current.origin().ascii_serialization(),
                    allowed: self.config.allowed_origins.clone(),
                });
            }

            debug!(url = %current, "fetching remote module");
            let response = self.client.get(current.clone()).send().await?;
            let status = response.status();

            // Handle redirects manually - only allow same-origin
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| FetchError::InvalidRedirect {
                        url: current.to_string(),
                        reason: "missing location header".into(),
                    })?;
                let next = current.join(location).map_err(|e| FetchError::InvalidRedirect {
                    url: current.to_string(),
                    reason: e.to_string(),
                })?;
                if next.origin() != origin {
                    return Err(FetchError::CrossOriginRedirect {
                        from: origin.ascii_serialization(),
                        to: next.origin().ascii_serialization(),
                    });
                }
                current = next;
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: current.to_string(),
                });
            }

            let source = self.read_body(&current, response).await?;
            return Ok(FetchedModule::new(current, source));
        }

        Err(FetchError::TooManyRedirects { url: url.to_string() })
    }
}

/// Default number of modules kept by a [`ModuleCache`].
pub const CACHE_MAX_ENTRIES: usize = 512;

/// Default total source bytes kept by a [`ModuleCache`] (64 MiB).
pub const CACHE_MAX_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Default)]
struct LruEntries {
    map: HashMap<Url, FetchedModule>,
    order: VecDeque<Url>,
    bytes: usize,
}

impl LruEntries {
    fn touch(&mut self, url: &Url) {
        if let Some(pos) = self.order.iter().position(|existing| existing == url) {
            self.order.remove(pos);
        }
        self.order.push_back(url.clone());
    }

    fn remove(&mut self, url: &Url) {
        if let Some(old) = self.map.remove(url) {
            self.bytes -= old.source.len();
        }
    }
}

/// Success-only module cache keyed by requested URL, shared by all renders.
/// Least recently used entries are evicted past `max_entries` or
/// `max_bytes` of source.
#[derive(Debug, Clone)]
pub struct ModuleCache {
    entries: Arc<Mutex<LruEntries>>,
    max_entries: usize,
    max_bytes: usize,
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::with_limits(CACHE_MAX_ENTRIES, CACHE_MAX_BYTES)
    }
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(LruEntries::default())),
            max_entries,
            max_bytes,
        }
    }

    pub fn get(&self, url: &Url) -> Option<FetchedModule> {
        let mut entries = self.entries.lock();
        let hit = entries.map.get(url).cloned();
        if hit.is_some() {
            entries.touch(url);
        }
        hit
    }

    /// Modules larger than the whole byte budget are not stored.
    pub fn insert(&self, url: Url, module: FetchedModule) {
        let size = module.source.len();
        if size > self.max_bytes || self.max_entries == 0 {
            return;
        }

        let mut entries = self.entries.lock();
        entries.remove(&url);
        entries.bytes += size;
        entries.map.insert(url.clone(), module);
        entries.touch(&url);

        while entries.map.len() > self.max_entries || entries.bytes > self.max_bytes {
            let Some(oldest) = entries.order.pop_front() else {
                break;
            };
            entries.remove(&oldest);
            trace!(url = %oldest, "evicted cached module");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().map.is_empty()
    }

    /// Total source bytes currently held.
    pub fn bytes(&self) -> usize {
        self.entries.lock().bytes
    }
}

/// Wraps a fetcher with a [`ModuleCache`]. One call's failure leaves the
/// cache untouched, so it cannot poison another call.
pub struct CachingFetcher<F> {
    inner: F,
    cache: ModuleCache,
}

impl<F: ModuleFetcher> CachingFetcher<F> {
    pub fn new(inner: F, cache: ModuleCache) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }
}

#[async_trait]
impl<F: ModuleFetcher> ModuleFetcher for CachingFetcher<F> {
    async fn fetch(&self, url: &Url) -> Result<FetchedModule, FetchError> {
        if let Some(hit) = self.cache.get(url) {
            trace!(url = %url, "module cache hit");
            return Ok(hit);
        }
        let module = self.inner.fetch(url).await?;
        self.cache.insert(url.clone(), module.clone());
        Ok(module)
    }
}
