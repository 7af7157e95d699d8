use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

pub mod logging;
pub mod proxy;
pub mod reliability;
pub mod server;
pub mod storage;
pub mod upstream;


pub use logging::LoggingConfig;
pub use proxy::ProxyConfig;
pub use reliability::{BackoffStrategy, ReliabilityConfig, RetryConfig};
pub use server::ServerConfig;
pub use storage::StorageConfig;
pub use upstream::UpstreamConfig;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Presence switches the registry into proxy mode.
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let candidate = path.unwrap_or_else(|| PathBuf::from("vein-npm.toml"));
        if candidate.exists() {
            let raw = fs::read_to_string(&candidate)
                .with_context(|| format!("failed to read config {}", candidate.display()))?;
            let mut config: Config = toml::from_str(&raw)
                .with_context(|| format!("invalid config {}", candidate.display()))?;
            let base = candidate.parent().unwrap_or(Path::new("."));
            config.storage.normalize_paths(base);
            config.proxy.normalize_paths(base);
            Ok(config)
        } else {
            if let Some(path) = candidate.to_str() {
                tracing::warn!("configuration file {path} not found, using defaults");
            } else {
                tracing::warn!("configuration file not found, using defaults");
            }
            let mut config = Config::default();
            let cwd = std::env::current_dir().context("reading current directory")?;
            config.storage.normalize_paths(&cwd);
            config.proxy.normalize_paths(&cwd);
            Ok(config)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(upstream) = &self.upstream {
            for url in upstream.urls() {
                if url.scheme() != "https" && url.scheme() != "http" {
                    bail!("unsupported upstream scheme {url}");
                }
            }
        }
        if let Some(base_url) = &self.server.base_url {
            match url::Url::parse(base_url) {
                Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
                _ => bail!("base_url must be an absolute http(s) URL, got {base_url:?}"),
            }
        }
        Ok(())
    }

    pub fn is_proxy(&self) -> bool {
        self.upstream.is_some()
    }
}
