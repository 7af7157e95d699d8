use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Seconds a cached package document is served without asking the
    /// upstream. `0` refreshes on every read.
    #[serde(default = "ProxyConfig::default_metadata_ttl_secs")]
    pub metadata_ttl_secs: u64,
    /// Where in-flight tarball downloads are staged. Defaults to the system
    /// temp dir.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

impl ProxyConfig {
    fn default_metadata_ttl_secs() -> u64 {
        86_400
    }

    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("vein-npm-staging"))
    }

    pub fn normalize_paths(&mut self, base_dir: &Path) {
        if let Some(dir) = self.staging_dir.as_mut()
            && dir.is_relative()
        {
            *dir = base_dir.join(&*dir);
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            metadata_ttl_secs: Self::default_metadata_ttl_secs(),
            staging_dir: None,
        }
    }
}
