use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{RegistryError, Result};

/// Storage key of the canonical document for `name`.
pub fn meta_key(name: &str) -> String {
    format!("{name}/meta.json")
}

/// An npm packument: everything the registry knows about one package.
///
/// Version descriptors are kept as opaque JSON; unknown top-level fields
/// (readme, description, maintainers, ...) round-trip through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDocument {
    pub name: String,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub versions: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub time: BTreeMap<String, JsonValue>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl PackageDocument {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| codec_error(err, "decoding stored package document"))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| codec_error(err, "encoding package document"))
    }

    pub fn to_json(&self) -> Result<JsonValue> {
        serde_json::to_value(self).map_err(|err| codec_error(err, "encoding package document"))
    }

    pub fn has_version(&self, version: &str) -> bool {
        self.versions.contains_key(version)
    }

    /// Relative tarball reference recorded for `version`, if any.
    pub fn tarball(&self, version: &str) -> Option<&str> {
        self.versions
            .get(version)?
            .get("dist")?
            .get("tarball")?
            .as_str()
    }

    /// Dist-tags whose target is not a published version.
    pub fn dangling_tags(&self) -> Vec<&str> {
        self.dist_tags
            .iter()
            .filter(|(_, version)| !self.versions.contains_key(*version))
            .map(|(tag, _)| tag.as_str())
            .collect()
    }
}

fn codec_error(err: serde_json::Error, what: &'static str) -> RegistryError {
    RegistryError::Storage(anyhow::Error::from(err).context(what))
}
