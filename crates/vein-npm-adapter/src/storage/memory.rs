use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::{Context, Result};
use parking_lot::RwLock;

use super::{BlobStore, validate_key};

/// In-process blob store, used for tests and ephemeral registries.
///
/// Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    blobs: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryStorage {
    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.blobs.read().contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.blobs.read().get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.blobs.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        validate_key(key)?;
        let bytes = tokio::fs::read(source)
            .await
            .with_context(|| format!("reading {}", source.display()))?;
        self.blobs.write().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.blobs.write().remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<bool> {
        let dir = prefix.trim_end_matches('/');
        validate_key(dir)?;
        let dir = format!("{dir}/");
        let mut blobs = self.blobs.write();
        let before = blobs.len();
        blobs.retain(|key, _| !key.starts_with(&dir));
        Ok(blobs.len() != before)
    }
}
