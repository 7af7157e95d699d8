//! Package metadata consistency engine.
//!
//! Every operation here is a pure transformation: it takes the current
//! document by reference and returns a new one. Reading the current value
//! from storage and writing the result back is the caller's job (see
//! [`crate::registry`]).

mod document;
mod payload;


use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value as JsonValue};

use crate::error::{RegistryError, Result};

pub use document::{PackageDocument, meta_key};
pub use payload::{
    Attachment, PublishPayload, is_valid_package_name, relative_tarball, short_name,
};
pub(crate) use payload::is_safe_relative;

/// npm timestamp format, e.g. `2024-03-24T12:15:16.000Z`.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Minimal document for a package that has never been published here.
pub fn skeleton(payload: &PublishPayload, now: DateTime<Utc>) -> PackageDocument {
    let mut extra: Map<String, JsonValue> = payload
        .extra
        .iter()
        .filter(|(key, _)| !key.starts_with('_'))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    extra.insert("_id".to_string(), JsonValue::String(payload.name.clone()));

    let time = if payload.time.is_empty() {
        let stamp = JsonValue::String(timestamp(now));
        [
            ("created".to_string(), stamp.clone()),
            ("modified".to_string(), stamp),
        ]
        .into_iter()
        .collect()
    } else {
        payload.time.clone()
    };

    PackageDocument {
        name: payload.name.clone(),
        dist_tags: payload.dist_tags.clone(),
        versions: Default::default(),
        time,
        extra,
    }
}

/// Folds the payload's versions into `existing` (or a fresh skeleton).
///
/// Each version is an "add" at `/versions/{version}`, which overwrites an
/// existing entry, so re-publishing the same payload is idempotent.
/// Dist-tags and `time` of an existing document are not touched.
pub fn merge(
    existing: Option<&PackageDocument>,
    payload: &PublishPayload,
    now: DateTime<Utc>,
) -> PackageDocument {
    let mut merged = match existing {
        Some(doc) => doc.clone(),
        None => skeleton(payload, now),
    };
    for (version, descriptor) in &payload.versions {
        merged.versions.insert(version.clone(), descriptor.clone());
    }
    merged
}

pub fn add_dist_tag(doc: &PackageDocument, tag: &str, version: &str) -> Result<PackageDocument> {
    if !doc.has_version(version) {
        return Err(RegistryError::not_found(format!(
            "version {version} of {}",
            doc.name
        )));
    }
    let mut updated = doc.clone();
    updated
        .dist_tags
        .insert(tag.to_string(), version.to_string());
    Ok(updated)
}

pub fn remove_dist_tag(doc: &PackageDocument, tag: &str) -> Result<PackageDocument> {
    if !doc.dist_tags.contains_key(tag) {
        return Err(RegistryError::not_found(format!(
            "dist-tag {tag} of {}",
            doc.name
        )));
    }
    let mut updated = doc.clone();
    updated.dist_tags.remove(tag);
    Ok(updated)
}

/// Drops `version` and every dist-tag that pointed at it.
pub fn unpublish_version(doc: &PackageDocument, version: &str) -> Result<PackageDocument> {
    if !doc.has_version(version) {
        return Err(RegistryError::not_found(format!(
            "version {version} of {}",
            doc.name
        )));
    }
    let mut updated = doc.clone();
    updated.versions.remove(version);
    updated.dist_tags.retain(|_, target| target != version);
    Ok(updated)
}

/// Versions present in `existing` but missing from a document submitted by
/// `npm unpublish name@version`, which PUTs the packument minus the version.
pub fn removed_versions(existing: &PackageDocument, submitted: &PackageDocument) -> Vec<String> {
    existing
        .versions
        .keys()
        .filter(|version| !submitted.versions.contains_key(*version))
        .cloned()
        .collect()
}

/// Records `time[version]` for versions that were not published before, and
/// bumps `time.modified`.
pub fn record_publish_times(
    doc: &PackageDocument,
    new_versions: &[String],
    now: DateTime<Utc>,
) -> PackageDocument {
    let stamp = JsonValue::String(timestamp(now));
    let mut updated = doc.clone();
    for version in new_versions {
        updated.time.insert(version.clone(), stamp.clone());
    }
    updated.time.insert("modified".to_string(), stamp.clone());
    updated.time.entry("created".to_string()).or_insert(stamp);
    updated
}

/// Everything a force-unpublish deletes: the document and every asset below
/// the package prefix. Irreversible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRemoval {
    pub name: String,
    pub meta_key: String,
    pub prefix: String,
}

pub fn force_unpublish(name: &str) -> PackageRemoval {
    PackageRemoval {
        name: name.to_string(),
        meta_key: meta_key(name),
        prefix: format!("{name}/"),
    }
}
