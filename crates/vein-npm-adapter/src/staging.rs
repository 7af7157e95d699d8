use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A uniquely named scratch file owned by a single download.
///
/// The file is removed by [`StagingFile::release`]. If the owner is dropped
/// without releasing (early return, cancelled future) the file is removed
/// synchronously on drop.
#[derive(Debug)]
pub struct StagingFile {
    path: PathBuf,
    file: Option<File>,
    written: u64,
}

impl StagingFile {
    pub async fn create(dir: &Path, prefix: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating staging dir {}", dir.display()))?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let name = format!("{prefix}{}-{timestamp}-{seq}.tmp", std::process::id());
        let path = dir.join(name);

        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
            .with_context(|| format!("creating staging file {}", path.display()))?;

        tracing::debug!(path = %path.display(), "staging file created");
        Ok(Self {
            path,
            file: Some(file),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended through [`StagingFile::write_chunk`] so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .with_context(|| format!("staging file {} already finished", self.path.display()))?;
        file.write_all(chunk)
            .await
            .with_context(|| format!("writing staging file {}", self.path.display()))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flushes and closes the write handle so the path can be read back.
    pub async fn finish(&mut self) -> Result<u64> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .with_context(|| format!("flushing staging file {}", self.path.display()))?;
        }
        Ok(self.written)
    }

    pub async fn release(mut self) -> Result<()> {
        drop(self.file.take());
        let path = std::mem::take(&mut self.path);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::from(e)
                .context(format!("removing staging file {}", path.display()))),
        }
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        drop(self.file.take());
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "staging file removed on drop");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove staging file"
                );
            }
        }
    }
}
