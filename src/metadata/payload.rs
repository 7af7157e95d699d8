use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

use crate::error::{RegistryError, Result};

/// Body of `npm publish`: the new versions plus their tarballs inlined as base64.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishPayload {
    pub name: String,
    #[serde(default)]
    pub versions: BTreeMap<String, JsonValue>,
    #[serde(rename = "_attachments", default)]
    pub attachments: BTreeMap<String, Attachment>,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub time: BTreeMap<String, JsonValue>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub content_type: Option<String>,
    pub data: String,
    #[serde(default)]
    pub length: Option<u64>,
}

impl PublishPayload {
    /// Parses and validates a publish body. Nothing about the payload is
    /// trusted until this returns `Ok`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let payload: PublishPayload = serde_json::from_slice(bytes)
            .map_err(|err| RegistryError::malformed(format!("invalid publish body: {err}")))?;
        payload.validate()?;
        Ok(payload)
    }

    fn validate(&self) -> Result<()> {
        if !is_valid_package_name(&self.name) {
            return Err(RegistryError::malformed(format!(
                "invalid package name {:?}",
                self.name
            )));
        }
        if self.versions.is_empty() {
            return Err(RegistryError::malformed("payload carries no versions"));
        }
        for (version, descriptor) in &self.versions {
            semver::Version::parse(version).map_err(|err| {
                RegistryError::malformed(format!("version {version:?} is not semver: {err}"))
            })?;
            let Some(object) = descriptor.as_object() else {
                return Err(RegistryError::malformed(format!(
                    "descriptor of {version} is not an object"
                )));
            };
            if let Some(name) = object.get("name").and_then(JsonValue::as_str)
                && name != self.name
            {
                return Err(RegistryError::malformed(format!(
                    "descriptor of {version} names package {name:?}"
                )));
            }
            if let Some(declared) = object.get("version").and_then(JsonValue::as_str)
                && declared != version
            {
                return Err(RegistryError::malformed(format!(
                    "descriptor keyed {version} declares version {declared}"
                )));
            }
        }
        for (tag, version) in &self.dist_tags {
            if !self.versions.contains_key(version) {
                return Err(RegistryError::malformed(format!(
                    "dist-tag {tag} points to {version}, which is not in the payload"
                )));
            }
        }
        Ok(())
    }

    /// Rewrites every `dist.tarball` to the registry-relative
    /// `/{name}/-/{file}` form under which the attachment is stored.
    pub fn with_relative_tarballs(mut self) -> Result<Self> {
        let name = self.name.clone();
        for (version, descriptor) in self.versions.iter_mut() {
            let Some(object) = descriptor.as_object_mut() else {
                continue;
            };
            let uploaded = object
                .get("dist")
                .and_then(|dist| dist.get("tarball"))
                .and_then(JsonValue::as_str);
            let relative = relative_tarball(&name, version, uploaded)?;
            let dist = object
                .entry("dist")
                .or_insert_with(|| JsonValue::Object(Map::new()));
            if let Some(dist) = dist.as_object_mut() {
                dist.insert("tarball".to_string(), JsonValue::String(relative));
            }
        }
        Ok(self)
    }
}

/// `/{name}/-/{file}` where `file` is whatever follows `/-/` in the uploaded
/// reference, or `{short-name}-{version}.tgz` when there is none.
pub fn relative_tarball(name: &str, version: &str, uploaded: Option<&str>) -> Result<String> {
    let file = uploaded
        .and_then(|reference| reference.split_once("/-/"))
        .map(|(_, file)| file.to_string())
        .filter(|file| !file.is_empty())
        .unwrap_or_else(|| format!("{}-{version}.tgz", short_name(name)));
    if !is_safe_relative(&file) {
        return Err(RegistryError::malformed(format!(
            "unsafe tarball file name {file:?}"
        )));
    }
    Ok(format!("/{name}/-/{file}"))
}

/// `simple` for `@hello/simple`, the name itself when unscoped.
pub fn short_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Accepts `name` and `@scope/name` where every component is a valid npm
/// name segment.
pub fn is_valid_package_name(name: &str) -> bool {
    match name.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, pkg)) => is_valid_name_segment(scope) && is_valid_name_segment(pkg),
            None => false,
        },
        None => is_valid_name_segment(name),
    }
}

fn is_valid_name_segment(segment: &str) -> bool {
    if segment.is_empty() || segment.len() > 214 {
        return false;
    }
    if segment.starts_with('.') || segment.starts_with('_') {
        return false;
    }
    segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'))
}

pub(crate) fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}
