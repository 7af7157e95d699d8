//! Storage doubles and fixtures shared by unit tests.

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use flate2::{Compression, write::GzEncoder};
use tar::{Builder, Header};
use vein_npm_adapter::{BlobStore, MemoryStorage};

/// In-memory store where the write following `allowed` successful ones fails.
/// Later writes succeed again.
pub struct FailingPuts {
    pub inner: MemoryStorage,
    allowed: usize,
    writes: AtomicUsize,
}

impl FailingPuts {
    pub fn after(allowed: usize) -> Self {
        Self::wrapping(MemoryStorage::new(), allowed)
    }

    pub fn wrapping(inner: MemoryStorage, allowed: usize) -> Self {
        Self {
            inner,
            allowed,
            writes: AtomicUsize::new(0),
        }
    }

    fn admit(&self, key: &str) -> Result<()> {
        if self.writes.fetch_add(1, Ordering::SeqCst) == self.allowed {
            bail!("disk full writing {key}");
        }
        Ok(())
    }
}

impl BlobStore for FailingPuts {
    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.admit(key)?;
        self.inner.put(key, bytes).await
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        self.admit(key)?;
        self.inner.put_file(key, source).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<bool> {
        self.inner.delete_prefix(prefix).await
    }
}

/// A `.tgz` holding `entries` as `(path, contents)` pairs.
pub fn gzipped_tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut tar_bytes = Vec::new();
    {
        let mut builder = Builder::new(&mut tar_bytes);
        for (path, contents) in entries {
            let mut header = Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, path, Cursor::new(*contents))
                .expect("append tar entry");
        }
        builder.finish().expect("finish tar");
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).expect("compress tar");
    encoder.finish().expect("finalize gzip")
}
