//! Error taxonomy shared by the registry core.

use thiserror::Error;

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Package, asset, version or dist-tag is absent.
    #[error("{0} not found")]
    NotFound(String),

    /// Publish payload rejected before anything was written.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Upstream registry unreachable or answered with an unexpected status.
    #[error("upstream failure: {0}")]
    Transport(String),

    /// The blob store failed; fatal for the current request.
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl RegistryError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload(reason.into())
    }

    pub fn transport(reason: impl std::fmt::Display) -> Self {
        Self::Transport(reason.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
