mod memory;

use std::{
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, bail};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};

pub use memory::MemoryStorage;

// Retry configuration constants
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_MS: u64 = 100;

/// Key/value blob storage shared by the hosted registry and the proxy cache.
///
/// Keys are slash-delimited and mirror npm paths, e.g. `@scope/name/meta.json`
/// or `@scope/name/-/name-1.0.0.tgz`.
// Uses explicit `impl Future + Send` to satisfy auto-trait bounds without #[allow]
pub trait BlobStore: Send + Sync {
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;
    fn put(&self, key: &str, bytes: &[u8]) -> impl Future<Output = Result<()>> + Send;
    /// Copies the file at `source` into the store under `key`.
    fn put_file(&self, key: &str, source: &Path) -> impl Future<Output = Result<()>> + Send;
    /// Returns `false` when nothing was stored under `key`.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;
    /// Removes every key below `prefix`. Returns `false` when the prefix was empty.
    fn delete_prefix(&self, prefix: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// Rejects keys that could escape the storage root or alias other keys.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        bail!("empty storage key");
    }
    if key.starts_with('/') || key.contains('\\') {
        bail!("invalid storage key {key:?}");
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        bail!("invalid storage key {key:?}");
    }
    Ok(())
}

#[derive(Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: PathBuf) -> Self {
        FilesystemStorage { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating storage root {}", self.root.display()))
    }

    pub fn resolve(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match fs::read(&path).await {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) if should_retry(&e) && attempt < MAX_ATTEMPTS => {
                    tracing::debug!(
                        "read attempt {}/{} failed with {:?}, retrying in {}ms: {}",
                        attempt,
                        MAX_ATTEMPTS,
                        e.kind(),
                        BACKOFF_MS,
                        path.display()
                    );
                    tokio::time::sleep(Duration::from_millis(BACKOFF_MS)).await;
                }
                Err(e) => {
                    return Err(anyhow::Error::from(e).context(format!(
                        "reading blob {} (after {} attempts)",
                        path.display(),
                        attempt
                    )));
                }
            }
        }
    }

    pub async fn create_temp_writer(&self, key: &str) -> Result<TempFile> {
        let final_path = self.resolve(key)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating storage dir {}", parent.display()))?;
        }

        let tmp_path = temp_path_for(&final_path);

        let mut attempt = 0;
        let file = loop {
            attempt += 1;
            match OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await
            {
                Ok(file) => break file,
                Err(e) if should_retry(&e) && attempt < MAX_ATTEMPTS => {
                    tracing::debug!(
                        "create_temp_writer attempt {}/{} failed with {:?}, retrying in {}ms: {}",
                        attempt,
                        MAX_ATTEMPTS,
                        e.kind(),
                        BACKOFF_MS,
                        tmp_path.display()
                    );
                    tokio::time::sleep(Duration::from_millis(BACKOFF_MS)).await;
                }
                Err(e) => {
                    return Err(anyhow::Error::from(e).context(format!(
                        "creating temp file {} (after {} attempts)",
                        tmp_path.display(),
                        attempt
                    )));
                }
            }
        };

        Ok(TempFile {
            tmp_path,
            final_path,
            file,
        })
    }
}

impl BlobStore for FilesystemStorage {
    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(anyhow::Error::from(e).context(format!("checking {}", path.display())))
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.read(key).await
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut temp = self.create_temp_writer(key).await?;
        if let Err(err) = temp.file_mut().write_all(bytes).await {
            temp.rollback().await?;
            return Err(anyhow::Error::from(err).context(format!("writing blob {key}")));
        }
        temp.commit().await
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        let mut input = File::open(source)
            .await
            .with_context(|| format!("opening {}", source.display()))?;
        let mut temp = self.create_temp_writer(key).await?;
        if let Err(err) = tokio::io::copy(&mut input, temp.file_mut()).await {
            temp.rollback().await?;
            return Err(anyhow::Error::from(err)
                .context(format!("copying {} into {key}", source.display())));
        }
        temp.commit().await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(anyhow::Error::from(e).context(format!("removing {}", path.display())))
            }
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<bool> {
        let dir = self.resolve(prefix.trim_end_matches('/'))?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(anyhow::Error::from(e).context(format!("removing {}", dir.display())))
            }
        }
    }
}

/// A write in progress: bytes land in a sibling temp file and are renamed
/// into place on commit, so readers never observe a partial blob.
pub struct TempFile {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: File,
}

impl TempFile {
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub async fn commit(self) -> Result<()> {
        let Self {
            tmp_path,
            final_path,
            mut file,
        } = self;

        file.flush()
            .await
            .with_context(|| format!("flushing {}", tmp_path.display()))?;
        drop(file);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match fs::rename(&tmp_path, &final_path).await {
                Ok(()) => return Ok(()),
                Err(e) if should_retry(&e) && attempt < MAX_ATTEMPTS => {
                    tracing::debug!(
                        "commit (rename) attempt {}/{} failed with {:?}, \
                         retrying in {}ms: {} -> {}",
                        attempt,
                        MAX_ATTEMPTS,
                        e.kind(),
                        BACKOFF_MS,
                        tmp_path.display(),
                        final_path.display()
                    );
                    tokio::time::sleep(Duration::from_millis(BACKOFF_MS)).await;
                }
                Err(e) => {
                    return Err(anyhow::Error::from(e).context(format!(
                        "moving {} to {} (after {} attempts)",
                        tmp_path.display(),
                        final_path.display(),
                        attempt
                    )));
                }
            }
        }
    }

    pub async fn rollback(self) -> Result<()> {
        let Self { tmp_path, file, .. } = self;
        drop(file);
        match fs::remove_file(&tmp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::from(e)
                .context(format!("removing temp file {}", tmp_path.display()))),
        }
    }
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid = std::process::id();
    let tmp_name = match final_path.file_name().and_then(|s| s.to_str()) {
        Some(name) => format!("{name}.tmp-{pid}-{timestamp}"),
        None => format!("tmp-{pid}-{timestamp}"),
    };
    final_path.with_file_name(tmp_name)
}

/// Determines if an I/O error should be retried
pub(crate) fn should_retry(error: &std::io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
        || matches!(error.raw_os_error(), Some(16) | Some(11))
    // 16 = EBUSY (Device or resource busy)
    // 11 = EAGAIN (Resource temporarily unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, FilesystemStorage) {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path().to_path_buf());
        (temp_dir, storage)
    }

    #[tokio::test]
    async fn test_prepare_creates_root_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage_path = temp_dir.path().join("storage_root");
        let storage = FilesystemStorage::new(storage_path.clone());

        assert!(!storage_path.exists());
        storage.prepare().await.unwrap();
        assert!(storage_path.is_dir());
        storage.prepare().await.unwrap();
    }

    #[test]
    fn test_resolve_joins_scoped_keys() {
        let (temp_dir, storage) = storage();
        let resolved = storage.resolve("@types/node/meta.json").unwrap();
        assert_eq!(resolved, temp_dir.path().join("@types/node/meta.json"));
    }

    #[test]
    fn test_validate_key_rejects_traversal() {
        assert!(validate_key("lodash/meta.json").is_ok());
        assert!(validate_key("@scope/name/-/@scope/name-1.0.0.tgz").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("../secret").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a\\b").is_err());
    }

    #[tokio::test]
    async fn test_get_returns_none_for_missing_key() {
        let (_dir, storage) = storage();
        assert!(storage.get("missing/meta.json").await.unwrap().is_none());
        assert!(!storage.exists("missing/meta.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_then_get_round_trips() {
        let (_dir, storage) = storage();
        storage
            .put("@hello/simple/meta.json", b"{\"name\":\"@hello/simple\"}")
            .await
            .unwrap();

        assert!(storage.exists("@hello/simple/meta.json").await.unwrap());
        let data = storage.get("@hello/simple/meta.json").await.unwrap().unwrap();
        assert_eq!(data, b"{\"name\":\"@hello/simple\"}");
    }

    #[tokio::test]
    async fn test_put_overwrites_existing_blob() {
        let (_dir, storage) = storage();
        storage.put("pkg/meta.json", b"first").await.unwrap();
        storage.put("pkg/meta.json", b"second").await.unwrap();
        assert_eq!(storage.get("pkg/meta.json").await.unwrap().unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_exists_is_false_for_directories() {
        let (_dir, storage) = storage();
        storage.put("pkg/-/pkg-1.0.0.tgz", b"tgz").await.unwrap();
        assert!(!storage.exists("pkg/-").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_file_copies_source() {
        let (dir, storage) = storage();
        let source = dir.path().join("source.bin");
        fs::write(&source, b"payload").await.unwrap();

        storage.put_file("pkg/-/pkg-1.0.0.tgz", &source).await.unwrap();

        assert_eq!(
            storage.get("pkg/-/pkg-1.0.0.tgz").await.unwrap().unwrap(),
            b"payload"
        );
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let (_dir, storage) = storage();
        storage.put("pkg/meta.json", b"{}").await.unwrap();
        assert!(storage.delete("pkg/meta.json").await.unwrap());
        assert!(!storage.delete("pkg/meta.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_prefix_removes_whole_package() {
        let (_dir, storage) = storage();
        storage.put("pkg/meta.json", b"{}").await.unwrap();
        storage.put("pkg/-/pkg-1.0.0.tgz", b"tgz").await.unwrap();
        storage.put("pkg-other/meta.json", b"{}").await.unwrap();

        assert!(storage.delete_prefix("pkg/").await.unwrap());

        assert!(!storage.exists("pkg/meta.json").await.unwrap());
        assert!(!storage.exists("pkg/-/pkg-1.0.0.tgz").await.unwrap());
        assert!(storage.exists("pkg-other/meta.json").await.unwrap());
        assert!(!storage.delete_prefix("pkg/").await.unwrap());
    }

    #[tokio::test]
    async fn test_rollback_removes_temp_file() {
        let (_dir, storage) = storage();
        let temp_file = storage.create_temp_writer("test/file.tgz").await.unwrap();
        let tmp_path = temp_file.tmp_path.clone();
        temp_file.rollback().await.unwrap();

        assert!(!tmp_path.exists());
        assert!(!storage.resolve("test/file.tgz").unwrap().exists());
    }

    #[test]
    fn test_temp_path_generation() {
        let final_path = PathBuf::from("foo/bar.tgz");
        let tmp_path = temp_path_for(&final_path);
        assert!(
            tmp_path
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("bar.tgz.tmp-")
        );
    }

    #[test]
    fn test_should_retry_logic() {
        assert!(should_retry(&std::io::Error::from(ErrorKind::WouldBlock)));
        assert!(should_retry(&std::io::Error::from(ErrorKind::Interrupted)));
        assert!(!should_retry(&std::io::Error::from(ErrorKind::NotFound)));
        assert!(!should_retry(&std::io::Error::from(
            ErrorKind::PermissionDenied
        )));
    }
}
