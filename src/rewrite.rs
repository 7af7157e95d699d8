//! Tarball reference rewriting for documents crossing the storage boundary.

use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceRewriter {
    /// Prefixes the public base URL: `/pkg/-/pkg-1.0.0.tgz` becomes
    /// `http://host:8346/pkg/-/pkg-1.0.0.tgz`.
    ClientBaseUrl { base: String },
    /// Mounts references under a repository path: `/npm/pkg/-/pkg-1.0.0.tgz`.
    RepositoryPrefix { prefix: String },
    /// Strips scheme and authority from upstream URLs, leaving the path.
    OriginRelative,
}

impl ReferenceRewriter {
    pub fn client_base_url(base: impl Into<String>) -> Self {
        let base = base.into();
        Self::ClientBaseUrl {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn repository_prefix(prefix: impl AsRef<str>) -> Self {
        Self::RepositoryPrefix {
            prefix: prefix.as_ref().trim_matches('/').to_string(),
        }
    }

    pub fn rewrite(&self, reference: &str) -> String {
        match self {
            Self::ClientBaseUrl { base } => {
                if is_absolute(reference) {
                    reference.to_string()
                } else {
                    format!("{base}{}", with_leading_slash(reference))
                }
            }
            Self::RepositoryPrefix { prefix } => {
                if is_absolute(reference) || prefix.is_empty() {
                    reference.to_string()
                } else {
                    format!("/{prefix}{}", with_leading_slash(reference))
                }
            }
            Self::OriginRelative => match url::Url::parse(reference) {
                Ok(url) if url.has_host() => url.path().to_string(),
                _ => reference.to_string(),
            },
        }
    }

    /// Returns a copy of `document` with every `dist.tarball` rewritten:
    /// each entry under `versions`, plus the top-level `dist` of a
    /// single-version document.
    pub fn rewrite_json(&self, document: &JsonValue) -> JsonValue {
        let mut rewritten = document.clone();
        self.rewrite_dist(&mut rewritten);
        if let Some(versions) = rewritten
            .get_mut("versions")
            .and_then(JsonValue::as_object_mut)
        {
            for descriptor in versions.values_mut() {
                self.rewrite_dist(descriptor);
            }
        }
        rewritten
    }

    fn rewrite_dist(&self, descriptor: &mut JsonValue) {
        let Some(dist) = descriptor.get_mut("dist").and_then(JsonValue::as_object_mut) else {
            return;
        };
        if let Some(tarball) = dist.get("tarball").and_then(JsonValue::as_str) {
            let rewritten = self.rewrite(tarball);
            dist.insert("tarball".to_string(), JsonValue::String(rewritten));
        }
    }
}

fn is_absolute(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

fn with_leading_slash(reference: &str) -> String {
    if reference.starts_with('/') {
        reference.to_string()
    } else {
        format!("/{reference}")
    }
}
