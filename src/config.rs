//! Renderer configuration and assembly of the default backends.

use crate::compiler::{Bundler, CompileOptions, GraphBundler};
use crate::fetch::{CachingFetcher, FetchConfig, FetchError, HttpFetcher, ModuleCache, ModuleFetcher};
use crate::import_map::{ImportMap, DEFAULT_REMOTE_ORIGIN};
use crate::sandbox::SandboxConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default whole-pipeline deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid remote origin '{origin}': {reason}")]
    InvalidOrigin { origin: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] FetchError),
}

/// Configuration for a [`Renderer`](crate::Renderer)
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Origin root-relative specifiers resolve against
    pub remote_origin: String,
    /// Process-wide default Import Map; per-request overrides merge on top
    pub import_map: ImportMap,
    pub fetch: FetchConfig,
    /// Keep successfully fetched modules across requests
    pub cache_remote_modules: bool,
    pub compile: CompileOptions,
    pub sandbox: SandboxConfig,
    /// Deadline for compile + execute + render (None = unlimited)
    pub timeout: Option<Duration>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            remote_origin: DEFAULT_REMOTE_ORIGIN.to_string(),
            import_map: ImportMap::with_runtime_defaults(),
            fetch: FetchConfig::default(),
            cache_remote_modules: true,
            compile: CompileOptions::default(),
            sandbox: SandboxConfig::default(),
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

impl RendererConfig {
    /// Same defaults, with `origin` as both the remote origin and the only
    /// allowed fetch origin.
    pub fn with_remote_origin(origin: impl Into<String>) -> Self {
        let origin = origin.into();
        let mut config = Self::default();
        config.fetch.allowed_origins = vec![origin.clone()];
        config.remote_origin = origin;
        config
    }

    pub fn remote_origin_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.remote_origin).map_err(|e| ConfigError::InvalidOrigin {
            origin: self.remote_origin.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
            return Err(ConfigError::InvalidOrigin {
                origin: self.remote_origin.clone(),
                reason: "expected an http(s) origin".to_string(),
            });
        }
        Ok(url)
    }

    /// The configured fetcher: HTTP, behind a success-only cache if enabled.
    pub fn build_fetcher(&self) -> Result<Arc<dyn ModuleFetcher>, ConfigError> {
        let http = HttpFetcher::new(self.fetch.clone())?;
        Ok(if self.cache_remote_modules {
            Arc::new(CachingFetcher::new(http, ModuleCache::new()))
        } else {
            Arc::new(http)
        })
    }

    /// The bundling backend. Fixed here, once, for the renderer's lifetime.
    pub fn build_bundler(&self) -> Result<Arc<dyn Bundler>, ConfigError> {
        Ok(Arc::new(GraphBundler::new(
            self.build_fetcher()?,
            self.remote_origin_url()?,
            self.compile.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RendererConfig::default();
        assert_eq!(config.remote_origin, "https://esm.sh");
        assert_eq!(config.fetch.allowed_origins, vec!["https://esm.sh".to_string()]);
        assert!(config.import_map.get("react/jsx-runtime").is_some_and(|c| c.external));
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert!(config.cache_remote_modules);
    }

    #[test]
    fn test_with_remote_origin() {
        let config = RendererConfig::with_remote_origin("http://127.0.0.1:4000");
        assert_eq!(config.fetch.allowed_origins, vec!["http://127.0.0.1:4000".to_string()]);
        assert_eq!(config.remote_origin_url().unwrap().port(), Some(4000));
    }

    #[test]
    fn test_rejects_bad_origin() {
        let mut config = RendererConfig::default();
        config.remote_origin = "not a url".to_string();
        assert!(matches!(config.remote_origin_url(), Err(ConfigError::InvalidOrigin { .. })));

        config.remote_origin = "file:///etc".to_string();
        assert!(config.build_bundler().is_err());
    }
}
