use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{RegistryError, Result};

/// Bookkeeping persisted for every cached blob, below [`SIDECAR_ROOT`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    /// `Last-Modified` reported by the upstream, verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    pub last_refreshed: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl CacheMeta {
    pub fn refreshed_at(now: DateTime<Utc>) -> Self {
        Self {
            last_modified: None,
            last_refreshed: now,
            content_type: None,
            sha256: None,
        }
    }

    /// Meta for a blob whose bookkeeping is missing or unreadable. It is
    /// always older than any TTL, so the next read refreshes it.
    pub fn unknown() -> Self {
        Self::refreshed_at(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub(crate) fn from_slice(bytes: Option<Vec<u8>>) -> Self {
        bytes
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_else(Self::unknown)
    }

    pub(crate) fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| {
            RegistryError::Storage(anyhow::Error::from(err).context("encoding cache meta"))
        })
    }
}

/// A cached value plus its [`CacheMeta`]. Callers own the value; nothing
/// they do with it reaches storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry<T> {
    pub value: T,
    pub meta: CacheMeta,
}

/// Package document exactly as persisted.
pub type CachedPackage = CachedEntry<String>;

/// Tarball bytes.
pub type CachedAsset = CachedEntry<Vec<u8>>;

impl<T> CachedEntry<T> {
    /// `now - last_refreshed <= ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        now.signed_duration_since(self.meta.last_refreshed) <= ttl
    }

    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.meta.last_refreshed)
    }
}

impl CachedEntry<String> {
    pub fn document(&self) -> Result<JsonValue> {
        serde_json::from_str(&self.value).map_err(|err| {
            RegistryError::Storage(anyhow::Error::from(err).context("parsing cached package"))
        })
    }
}

/// Root of the sidecar namespace. No package name starts with `.`, so no
/// request path can resolve below it.
pub const SIDECAR_ROOT: &str = ".meta";

/// `.meta/{name}/package.json`
pub fn package_meta_key(name: &str) -> String {
    format!("{SIDECAR_ROOT}/{name}/package.json")
}

/// `.meta/{path}.json`
pub fn asset_meta_key(path: &str) -> String {
    format!("{SIDECAR_ROOT}/{path}.json")
}
