use std::path::{Path, PathBuf};

use serde::Deserialize;
use vein_npm_adapter::FilesystemStorage;

/// Where package documents, tarballs and proxy cache entries live.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl StorageConfig {
    /// Relative paths are resolved against the config file's directory.
    pub fn normalize_paths(&mut self, base_dir: &Path) {
        if self.path.is_relative() {
            self.path = base_dir.join(&self.path);
        }
    }

    /// Blob store rooted at `path`; call `prepare` before serving.
    pub fn open(&self) -> FilesystemStorage {
        FilesystemStorage::new(self.path.clone())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./npm-storage")
}
