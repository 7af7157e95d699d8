//! npm registry paths and request bookkeeping
//!
//! Handles both scoped (@org/package) and unscoped packages.

use std::time::Instant;

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use rama::http::{Body, Method, Request};

use crate::archive::asset_key;
use crate::metadata::{is_safe_relative, is_valid_package_name};

/// Cache status for request tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Pass,
    Hit,
    Miss,
    Error,
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStatus::Pass => write!(f, "pass"),
            CacheStatus::Hit => write!(f, "hit"),
            CacheStatus::Miss => write!(f, "miss"),
            CacheStatus::Error => write!(f, "error"),
        }
    }
}

/// Request context for tracking request lifecycle
pub struct RequestContext {
    pub start: Instant,
    /// Wall-clock start, compared against cache refresh stamps.
    pub received_at: DateTime<Utc>,
    pub method: Method,
    pub path: String,
    pub cache: CacheStatus,
}

impl RequestContext {
    pub fn from_request(req: &Request<Body>) -> Self {
        Self {
            start: Instant::now(),
            received_at: Utc::now(),
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            cache: CacheStatus::Pass,
        }
    }

    pub fn summary(&self) -> String {
        format!("{} {}", self.method.as_str(), self.path)
    }
}

/// What a registry path points at, independent of the HTTP method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NpmTarget {
    /// `/-/ping`
    Ping,
    /// `/{name}`
    Package { name: String },
    /// `/{name}/{version-or-tag}`
    Version { name: String, version: String },
    /// `/{name}/-/{file}`
    Tarball { name: String, file: String },
    /// `/{name}/-rev/{rev}`
    Revision { name: String, rev: String },
    /// `/{name}/-/{file}/-rev/{rev}`, sent by `npm unpublish` after the
    /// document update
    TarballRevision {
        name: String,
        file: String,
        rev: String,
    },
    /// `/-/package/{name}/dist-tags`
    DistTags { name: String },
    /// `/-/package/{name}/dist-tags/{tag}`
    DistTag { name: String, tag: String },
}

impl NpmTarget {
    /// Parse a registry path (already stripped of any mount prefix).
    ///
    /// Handles:
    /// - `/lodash`, `/@types/node`, `/@types%2fnode` - package documents
    /// - `/lodash/4.17.21`, `/lodash/latest` - single version documents
    /// - `/lodash/-/lodash-4.17.21.tgz` - tarballs
    /// - `/lodash/-rev/3-abc` - revision writes (unpublish)
    /// - `/-/package/lodash/dist-tags[/beta]` - dist-tag API
    pub fn from_path(path: &str) -> Option<Self> {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return None;
        }

        // Decode URL encoding (e.g., %40 -> @, %2f -> /)
        let decoded = percent_decode_str(trimmed).decode_utf8().ok()?;
        let decoded = decoded.trim_start_matches('/').trim_end_matches('/');
        if decoded.is_empty() || decoded.contains('\\') {
            return None;
        }

        if decoded == "-/ping" {
            return Some(Self::Ping);
        }
        if let Some(rest) = decoded.strip_prefix("-/package/") {
            return Self::parse_dist_tags(rest);
        }
        if let Some((head, rev)) = decoded.split_once("/-rev/") {
            if !is_safe_segment(rev) {
                return None;
            }
            if let Some((name, file)) = head.split_once("/-/") {
                let name = package_name(name)?;
                if !is_safe_relative(file) {
                    return None;
                }
                return Some(Self::TarballRevision {
                    name,
                    file: file.to_string(),
                    rev: rev.to_string(),
                });
            }
            let name = package_name(head)?;
            return Some(Self::Revision {
                name,
                rev: rev.to_string(),
            });
        }
        if let Some((name, file)) = decoded.split_once("/-/") {
            let name = package_name(name)?;
            if !is_safe_relative(file) {
                return None;
            }
            return Some(Self::Tarball {
                name,
                file: file.to_string(),
            });
        }
        Self::parse_document_path(decoded)
    }

    fn parse_dist_tags(rest: &str) -> Option<Self> {
        let (name, tail) = rest.split_once("/dist-tags")?;
        let name = package_name(name)?;
        match tail.strip_prefix('/') {
            None if tail.is_empty() => Some(Self::DistTags { name }),
            Some(tag) if is_safe_segment(tag) => Some(Self::DistTag {
                name,
                tag: tag.to_string(),
            }),
            _ => None,
        }
    }

    fn parse_document_path(decoded: &str) -> Option<Self> {
        // A scoped name spans two segments
        let name_segments = if decoded.starts_with('@') { 2 } else { 1 };
        let segments: Vec<&str> = decoded.splitn(name_segments + 1, '/').collect();
        if segments.len() < name_segments {
            return None;
        }
        let name = package_name(&segments[..name_segments].join("/"))?;
        match segments.get(name_segments) {
            None => Some(Self::Package { name }),
            Some(version) if is_valid_version_segment(version) => Some(Self::Version {
                name,
                version: version.to_string(),
            }),
            Some(_) => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Ping => None,
            Self::Package { name }
            | Self::Version { name, .. }
            | Self::Tarball { name, .. }
            | Self::Revision { name, .. }
            | Self::TarballRevision { name, .. }
            | Self::DistTags { name }
            | Self::DistTag { name, .. } => Some(name),
        }
    }

    /// Storage key for tarball targets.
    pub fn asset_key(&self) -> Option<String> {
        match self {
            Self::Tarball { name, file } | Self::TarballRevision { name, file, .. } => {
                Some(asset_key(name, file))
            }
            _ => None,
        }
    }
}

fn package_name(candidate: &str) -> Option<String> {
    is_valid_package_name(candidate).then(|| candidate.to_string())
}

fn is_valid_version_segment(segment: &str) -> bool {
    is_safe_segment(segment)
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains('/')
        && !segment.contains('\\')
        && segment.chars().all(|c| c.is_ascii_graphic())
}
