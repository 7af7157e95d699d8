use std::future::Future;

use vein_npm_adapter::StagingFile;

use crate::error::Result;

/// A package document fetched from the upstream registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePackage {
    pub content: String,
    pub last_modified: Option<String>,
}

/// Headers of an asset whose body was written into a staging file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteAsset {
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
}

/// Upstream registry access.
///
/// `Ok(None)` means the upstream answered and has nothing under that name.
/// Failing to get an answer at all is [`crate::error::RegistryError::Transport`].
pub trait RemoteClient: Send + Sync {
    fn fetch_package(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<RemotePackage>>> + Send;

    /// Streams the asset body into `staging`.
    fn fetch_asset(
        &self,
        path: &str,
        staging: &mut StagingFile,
    ) -> impl Future<Output = Result<Option<RemoteAsset>>> + Send;

    /// Releases connections. Calling it twice is harmless.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
