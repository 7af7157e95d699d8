use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use breaker_machines::CircuitBreaker;
use chrono_machines::{BackoffPolicy, BackoffStrategy};
use futures_util::StreamExt;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use reqwest::{StatusCode, header};
use tracing::{debug, info, warn};
use url::Url;
use vein_npm_adapter::StagingFile;

use crate::config::UpstreamConfig;
use crate::error::{RegistryError, Result};
use crate::proxy::{RemoteAsset, RemoteClient, RemotePackage};
use crate::rewrite::ReferenceRewriter;

const UA: &str = concat!("vein-npm/", env!("CARGO_PKG_VERSION"));

/// Upstream npm registry over HTTP with retry, fallback mirrors and a
/// circuit breaker.
pub struct HttpRemote {
    client: reqwest::Client,
    upstreams: Vec<Url>,
    backoff: BackoffPolicy,
    breaker: Arc<Mutex<CircuitBreaker>>,
    closed: AtomicBool,
}

/// How a single upstream answered.
enum Outcome {
    Found(reqwest::Response),
    Missing,
}

impl HttpRemote {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        // Open after 5 failed fetches in 60s, half-open again after 30s
        let breaker = CircuitBreaker::builder("npm_upstream")
            .failure_threshold(5)
            .failure_window_secs(60.0)
            .half_open_timeout_secs(30.0)
            .success_threshold(2)
            .jitter_factor(0.1)
            .on_open(|name| {
                warn!(circuit = %name, "Circuit breaker opened - upstream is failing");
            })
            .on_close(|name| {
                info!(circuit = %name, "Circuit breaker closed - upstream recovered");
            })
            .on_half_open(|name| {
                info!(circuit = %name, "Circuit breaker half-open - testing upstream");
            })
            .build();

        let client = reqwest::Client::builder()
            .user_agent(UA)
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(config.connection_pool_size)
            .build()
            .context("building upstream http client")?;

        let upstreams: Vec<Url> = config.urls().map(with_trailing_slash).collect();
        let retry = &config.reliability.retry;
        let backoff = retry.policy();

        info!(
            upstream = %config.url,
            fallbacks = config.fallback_urls.len(),
            timeout_secs = config.timeout_secs,
            pool = config.connection_pool_size,
            strategy = ?retry.backoff_strategy,
            max_attempts = backoff.max_attempts(),
            "Upstream client initialized (reqwest + circuit breaker)",
        );

        Ok(Self {
            client,
            upstreams,
            backoff,
            breaker: Arc::new(Mutex::new(breaker)),
            closed: AtomicBool::new(false),
        })
    }

    /// Tries every upstream in order until one answers.
    async fn fetch(
        &self,
        locate: impl Fn(&Url) -> Result<Url>,
    ) -> Result<Option<reqwest::Response>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::transport("upstream client is closed"));
        }
        if self.breaker.lock().is_open() {
            return Err(RegistryError::transport(
                "circuit breaker is open - upstream is currently unavailable",
            ));
        }

        let mut last_err = None;
        for base in &self.upstreams {
            let url = locate(base)?;
            match self.get_with_retry(&url).await {
                Ok(Outcome::Found(response)) => return Ok(Some(response)),
                Ok(Outcome::Missing) => return Ok(None),
                Err(err) => {
                    warn!(url = %url, error = %err, "upstream fetch failed");
                    last_err = Some(err);
                }
            }
        }
        Err(RegistryError::transport(
            last_err.unwrap_or_else(|| "no upstream configured".to_string()),
        ))
    }

    async fn get_with_retry(&self, url: &Url) -> std::result::Result<Outcome, String> {
        let max_attempts = self.backoff.max_attempts();
        let mut rng = SmallRng::from_os_rng();
        let start = Instant::now();
        let mut attempt: u8 = 0;

        loop {
            attempt += 1;
            let failure = match self.client.get(url.clone()).send().await {
                Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                    self.breaker.lock().record_success(start.elapsed().as_secs_f64());
                    return Ok(Outcome::Missing);
                }
                Ok(response) if response.status().is_success() => {
                    self.breaker.lock().record_success(start.elapsed().as_secs_f64());
                    return Ok(Outcome::Found(response));
                }
                Ok(response) if is_retryable(response.status()) => {
                    format!("{url} returned {}", response.status())
                }
                Ok(response) => {
                    // Client errors say nothing about upstream health
                    self.breaker.lock().record_success(start.elapsed().as_secs_f64());
                    return Err(format!("{url} returned {}", response.status()));
                }
                Err(err) => format!("{url} failed: {err}"),
            };

            if attempt >= max_attempts {
                let mut breaker = self.breaker.lock();
                breaker.record_failure(start.elapsed().as_secs_f64());
                breaker.check_and_trip();
                return Err(failure);
            }

            let delay_ms = self.backoff.delay(attempt, &mut rng).unwrap_or_default();
            debug!(
                url = %url,
                attempt,
                delay_ms,
                error = %failure,
                "retrying upstream"
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }
}

impl RemoteClient for HttpRemote {
    async fn fetch_package(&self, name: &str) -> Result<Option<RemotePackage>> {
        let Some(response) = self.fetch(|base| package_url(base, name)).await? else {
            return Ok(None);
        };
        let last_modified = header_string(&response, header::LAST_MODIFIED);
        let body = response
            .bytes()
            .await
            .map_err(|err| {
                RegistryError::transport(format!("reading {name} document: {err}"))
            })?;
        let document: serde_json::Value = serde_json::from_slice(&body).map_err(|err| {
            RegistryError::transport(format!("{name} document is not JSON: {err}"))
        })?;
        let content = ReferenceRewriter::OriginRelative
            .rewrite_json(&document)
            .to_string();
        Ok(Some(RemotePackage {
            content,
            last_modified,
        }))
    }

    async fn fetch_asset(
        &self,
        path: &str,
        staging: &mut StagingFile,
    ) -> Result<Option<RemoteAsset>> {
        let Some(response) = self.fetch(|base| asset_url(base, path)).await? else {
            return Ok(None);
        };
        let asset = RemoteAsset {
            last_modified: header_string(&response, header::LAST_MODIFIED),
            content_type: header_string(&response, header::CONTENT_TYPE),
        };
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .map_err(|err| RegistryError::transport(format!("downloading {path}: {err}")))?;
            staging.write_chunk(&chunk).await?;
        }
        debug!(asset = %path, size = staging.written(), "asset downloaded");
        Ok(Some(asset))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("upstream client closed");
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn header_string(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn with_trailing_slash(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Scoped names travel as `@scope%2fname`, the form every npm registry accepts.
pub fn package_url(base: &Url, name: &str) -> Result<Url> {
    base.join(&name.replace('/', "%2f"))
        .map_err(|err| RegistryError::transport(format!("building url for {name}: {err}")))
}

pub fn asset_url(base: &Url, path: &str) -> Result<Url> {
    base.join(path.trim_start_matches('/'))
        .map_err(|err| RegistryError::transport(format!("building url for {path}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(url: &str) -> Url {
        with_trailing_slash(&Url::parse(url).unwrap())
    }

    #[test]
    fn package_url_encodes_scope_separator() {
        let url = package_url(&base("https://registry.npmjs.org"), "@types/node").unwrap();
        assert_eq!(url.as_str(), "https://registry.npmjs.org/@types%2fnode");
        let url = package_url(&base("https://registry.npmjs.org/"), "lodash").unwrap();
        assert_eq!(url.as_str(), "https://registry.npmjs.org/lodash");
    }

    #[test]
    fn urls_respect_mirror_path() {
        let mirror = base("https://mirror.example.com/npm");
        assert_eq!(
            package_url(&mirror, "lodash").unwrap().as_str(),
            "https://mirror.example.com/npm/lodash"
        );
        assert_eq!(
            asset_url(&mirror, "/@types/node/-/node-18.0.0.tgz")
                .unwrap()
                .as_str(),
            "https://mirror.example.com/npm/@types/node/-/node-18.0.0.tgz"
        );
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn closed_client_refuses_fetches() {
        let remote = HttpRemote::new(&UpstreamConfig::default()).unwrap();
        remote.close().await;
        remote.close().await;

        let err = remote.fetch_package("lodash").await.unwrap_err();
        assert!(matches!(err, RegistryError::Transport(_)));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_transport_error() {
        let mut config = UpstreamConfig {
            url: Url::parse("http://127.0.0.1:9/").unwrap(),
            timeout_secs: 2,
            ..UpstreamConfig::default()
        };
        config.reliability.retry.max_attempts = 1;
        let remote = HttpRemote::new(&config).unwrap();

        let err = remote.fetch_package("lodash").await.unwrap_err();
        assert!(matches!(err, RegistryError::Transport(_)));
    }
}
