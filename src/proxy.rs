//! Read-through cache in front of an upstream npm registry.
//!
//! Package documents are refreshed once they are older than the configured
//! TTL and fall back to the stale copy when the upstream cannot provide a
//! new one. Tarballs are immutable: once cached they are served without
//! contacting the upstream again.

mod cache;
mod remote;


use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use vein_npm_adapter::{BlobStore, StagingFile};

use crate::error::{RegistryError, Result};
use crate::metadata::meta_key;

pub use cache::{
    CacheMeta, CachedAsset, CachedEntry, CachedPackage, asset_meta_key, package_meta_key,
};
pub use remote::{RemoteAsset, RemoteClient, RemotePackage};

const STAGING_PREFIX: &str = "npm-asset-";

pub struct ProxyCache<S, R> {
    storage: Arc<S>,
    remote: R,
    ttl: TimeDelta,
    staging_dir: PathBuf,
}

impl<S: BlobStore, R: RemoteClient> ProxyCache<S, R> {
    pub fn new(storage: Arc<S>, remote: R, ttl: Duration, staging_dir: PathBuf) -> Self {
        Self {
            storage,
            remote,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            staging_dir,
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    pub async fn get_package(&self, name: &str) -> Result<Option<CachedPackage>> {
        self.get_package_at(name, Utc::now()).await
    }

    /// [`ProxyCache::get_package`] evaluated at `now`.
    pub async fn get_package_at(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CachedPackage>> {
        let cached = self.cached_package(name).await?;
        if let Some(entry) = &cached
            && entry.is_fresh(now, self.ttl)
        {
            debug!(
                package = %name,
                age_secs = entry.age(now).num_seconds(),
                "serving fresh package"
            );
            return Ok(cached);
        }

        let fetched = self
            .remote
            .fetch_package(name)
            .await
            .and_then(|remote| remote.map(validated).transpose());

        match fetched {
            Ok(Some(remote)) => {
                let entry = self.store_package(name, remote, now).await?;
                info!(package = %name, refreshed = cached.is_some(), "cached upstream package");
                Ok(Some(entry))
            }
            Ok(None) => {
                if cached.is_some() {
                    debug!(package = %name, "upstream lost package, serving stale copy");
                }
                Ok(cached)
            }
            Err(RegistryError::Transport(reason)) if cached.is_some() => {
                warn!(package = %name, error = %reason, "upstream failed, serving stale copy");
                Ok(cached)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get_asset(&self, path: &str) -> Result<Option<CachedAsset>> {
        if let Some(entry) = self.cached_asset(path).await? {
            debug!(asset = %path, "serving cached asset");
            return Ok(Some(entry));
        }

        let mut staging = StagingFile::create(&self.staging_dir, STAGING_PREFIX).await?;
        let outcome = self.stage_and_store(path, &mut staging).await;
        if let Err(err) = staging.release().await {
            warn!(asset = %path, error = %err, "failed to release staging file");
        }
        outcome
    }

    pub async fn close(&self) {
        self.remote.close().await;
    }

    async fn cached_package(&self, name: &str) -> Result<Option<CachedPackage>> {
        let Some(bytes) = self.storage.get(&meta_key(name)).await? else {
            return Ok(None);
        };
        let value = String::from_utf8(bytes).map_err(|err| {
            RegistryError::Storage(
                anyhow::Error::from(err).context(format!("cached package {name} is not UTF-8")),
            )
        })?;
        let meta = CacheMeta::from_slice(self.storage.get(&package_meta_key(name)).await?);
        Ok(Some(CachedEntry { value, meta }))
    }

    async fn store_package(
        &self,
        name: &str,
        remote: RemotePackage,
        now: DateTime<Utc>,
    ) -> Result<CachedPackage> {
        let meta = CacheMeta {
            last_modified: remote.last_modified,
            content_type: Some("application/json".to_string()),
            ..CacheMeta::refreshed_at(now)
        };
        self.storage
            .put(&meta_key(name), remote.content.as_bytes())
            .await?;
        self.storage
            .put(&package_meta_key(name), &meta.to_vec()?)
            .await?;
        Ok(CachedEntry {
            value: remote.content,
            meta,
        })
    }

    async fn cached_asset(&self, path: &str) -> Result<Option<CachedAsset>> {
        let Some(value) = self.storage.get(path).await? else {
            return Ok(None);
        };
        let meta = CacheMeta::from_slice(self.storage.get(&asset_meta_key(path)).await?);
        Ok(Some(CachedEntry { value, meta }))
    }

    async fn stage_and_store(
        &self,
        path: &str,
        staging: &mut StagingFile,
    ) -> Result<Option<CachedAsset>> {
        let Some(remote) = self.remote.fetch_asset(path, staging).await? else {
            debug!(asset = %path, "asset not found upstream");
            return Ok(None);
        };
        let size = staging.finish().await?;
        let staged = tokio::fs::read(staging.path()).await.map_err(|err| {
            RegistryError::Storage(
                anyhow::Error::from(err)
                    .context(format!("reading staged asset {}", staging.path().display())),
            )
        })?;

        let meta = CacheMeta {
            last_modified: remote.last_modified,
            content_type: remote.content_type,
            sha256: Some(hex::encode(Sha256::digest(&staged))),
            ..CacheMeta::refreshed_at(Utc::now())
        };
        self.storage.put_file(path, staging.path()).await?;
        self.storage
            .put(&asset_meta_key(path), &meta.to_vec()?)
            .await?;
        info!(asset = %path, size, "cached upstream asset");

        self.cached_asset(path)
            .await?
            .ok_or_else(|| {
                RegistryError::Storage(anyhow::anyhow!("asset {path} vanished after caching"))
            })
            .map(Some)
    }
}

fn validated(remote: RemotePackage) -> Result<RemotePackage> {
    serde_json::from_str::<serde_json::Value>(&remote.content)
        .map_err(|err| RegistryError::transport(format!("upstream sent invalid JSON: {err}")))?;
    Ok(remote)
}
