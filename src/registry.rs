//! Hosted registry: applies metadata transformations against storage.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use vein_npm_adapter::BlobStore;

use crate::archive;
use crate::error::{RegistryError, Result};
use crate::metadata::{self, PackageDocument, PublishPayload, is_valid_package_name, meta_key};

/// Lock table size above which idle entries are pruned.
const LOCK_TABLE_PRUNE_AT: usize = 1024;

pub struct LocalRegistry<S> {
    storage: Arc<S>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<S: BlobStore> LocalRegistry<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub async fn publish(&self, body: &[u8]) -> Result<PackageDocument> {
        self.publish_at(body, Utc::now()).await
    }

    /// Validates the whole payload, including every attachment, before
    /// anything is written.
    pub async fn publish_at(&self, body: &[u8], now: DateTime<Utc>) -> Result<PackageDocument> {
        let payload = PublishPayload::from_slice(body)?.with_relative_tarballs()?;
        let attachments = archive::decode_attachments(&payload)?;

        let _guard = self.lock(&payload.name).await;
        let existing = self.load(&payload.name).await?;
        let new_versions: Vec<String> = payload
            .versions
            .keys()
            .filter(|version| {
                !existing
                    .as_ref()
                    .is_some_and(|doc| doc.has_version(version))
            })
            .cloned()
            .collect();

        let mut doc = metadata::merge(existing.as_ref(), &payload, now);
        for (tag, version) in &payload.dist_tags {
            doc = metadata::add_dist_tag(&doc, tag, version)?;
        }
        let doc = metadata::record_publish_times(&doc, &new_versions, now);

        let stored = archive::store_attachments(self.storage.as_ref(), attachments).await?;
        if let Err(err) = self.save(&doc).await {
            stored.roll_back(self.storage.as_ref()).await;
            return Err(err);
        }

        info!(
            package = %doc.name,
            versions = ?new_versions,
            attachments = stored.len(),
            "package published"
        );
        Ok(doc)
    }

    /// curl-style publish: `tarball` is the raw `.tgz` uploaded as `file`.
    pub async fn publish_tarball(
        &self,
        name: &str,
        file: &str,
        tarball: &[u8],
    ) -> Result<PackageDocument> {
        let body = archive::publish_body_from_tarball(name, file, tarball)?;
        self.publish_at(&body, Utc::now()).await
    }

    pub async fn package(&self, name: &str) -> Result<Option<PackageDocument>> {
        if !is_valid_package_name(name) {
            return Ok(None);
        }
        self.load(name).await
    }

    pub async fn asset(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.storage.get(key).await?)
    }

    pub async fn dist_tags(&self, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.package(name).await?.map(|doc| doc.dist_tags))
    }

    pub async fn add_dist_tag(
        &self,
        name: &str,
        tag: &str,
        version: &str,
    ) -> Result<PackageDocument> {
        let _guard = self.lock(name).await;
        let doc = self.require(name).await?;
        let updated = metadata::add_dist_tag(&doc, tag, version)?;
        self.save(&updated).await?;
        info!(package = %name, tag = %tag, version = %version, "dist-tag set");
        Ok(updated)
    }

    pub async fn remove_dist_tag(&self, name: &str, tag: &str) -> Result<PackageDocument> {
        let _guard = self.lock(name).await;
        let doc = self.require(name).await?;
        let updated = metadata::remove_dist_tag(&doc, tag)?;
        self.save(&updated).await?;
        info!(package = %name, tag = %tag, "dist-tag removed");
        Ok(updated)
    }

    /// Removes `version`, the dist-tags pointing at it and its tarball.
    pub async fn unpublish_version(&self, name: &str, version: &str) -> Result<PackageDocument> {
        let _guard = self.lock(name).await;
        let doc = self.require(name).await?;
        let tarball = tarball_key(&doc, version);
        let updated = metadata::unpublish_version(&doc, version)?;
        self.save(&updated).await?;
        self.delete_tarballs(tarball.into_iter()).await;
        info!(package = %name, version = %version, "version unpublished");
        Ok(updated)
    }

    /// npm's `unpublish name@version` flow: the client PUTs the document
    /// without the versions to drop, plus the dist-tags it wants afterwards.
    pub async fn unpublish_missing(&self, name: &str, body: &[u8]) -> Result<PackageDocument> {
        let submitted = serde_json::from_slice::<PackageDocument>(body)
            .map_err(|err| RegistryError::malformed(format!("invalid package document: {err}")))?;
        if submitted.name != name {
            return Err(RegistryError::malformed(format!(
                "document for {:?} submitted to {name}",
                submitted.name
            )));
        }

        let _guard = self.lock(name).await;
        let existing = self.require(name).await?;
        let removed = metadata::removed_versions(&existing, &submitted);

        let mut doc = existing.clone();
        let mut tarballs = Vec::with_capacity(removed.len());
        for version in &removed {
            tarballs.extend(tarball_key(&doc, version));
            doc = metadata::unpublish_version(&doc, version)?;
        }
        for (tag, version) in &submitted.dist_tags {
            if doc.has_version(version) {
                doc = metadata::add_dist_tag(&doc, tag, version)?;
            }
        }

        self.save(&doc).await?;
        self.delete_tarballs(tarballs.into_iter()).await;
        info!(package = %name, removed = ?removed, "versions unpublished");
        Ok(doc)
    }

    /// Deletes a stored tarball of `name` once no version refers to it.
    ///
    /// Returns `false` when nothing was stored under `key`.
    pub async fn remove_tarball(&self, name: &str, key: &str) -> Result<bool> {
        let _guard = self.lock(name).await;
        if let Some(doc) = self.package(name).await? {
            let referenced = doc
                .versions
                .keys()
                .find(|version| tarball_key(&doc, version).as_deref() == Some(key));
            if let Some(version) = referenced {
                return Err(RegistryError::malformed(format!(
                    "tarball {key} is still referenced by {name}@{version}"
                )));
            }
        }
        let removed = self.storage.delete(key).await?;
        debug!(package = %name, key = %key, removed, "tarball removal requested");
        Ok(removed)
    }

    /// Deletes the package document and every stored tarball.
    pub async fn force_unpublish(&self, name: &str) -> Result<()> {
        if !is_valid_package_name(name) {
            return Err(RegistryError::not_found(format!("package {name}")));
        }
        let _guard = self.lock(name).await;
        let removal = metadata::force_unpublish(name);
        if !self.storage.exists(&removal.meta_key).await? {
            return Err(RegistryError::not_found(format!("package {name}")));
        }
        self.storage.delete_prefix(&removal.prefix).await?;
        warn!(package = %removal.name, "package force-unpublished");
        Ok(())
    }

    async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() >= LOCK_TABLE_PRUNE_AT {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(name.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn load(&self, name: &str) -> Result<Option<PackageDocument>> {
        match self.storage.get(&meta_key(name)).await? {
            Some(bytes) => PackageDocument::from_slice(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn require(&self, name: &str) -> Result<PackageDocument> {
        if !is_valid_package_name(name) {
            return Err(RegistryError::not_found(format!("package {name}")));
        }
        self.load(name)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("package {name}")))
    }

    async fn save(&self, doc: &PackageDocument) -> Result<()> {
        self.storage.put(&meta_key(&doc.name), &doc.to_vec()?).await?;
        Ok(())
    }

    async fn delete_tarballs(&self, keys: impl Iterator<Item = String>) {
        for key in keys {
            match self.storage.delete(&key).await {
                Ok(true) => debug!(key = %key, "tarball deleted"),
                Ok(false) => debug!(key = %key, "tarball already absent"),
                Err(err) => warn!(key = %key, error = %err, "failed to delete tarball"),
            }
        }
    }
}

/// Storage key of the tarball recorded for `version`.
fn tarball_key(doc: &PackageDocument, version: &str) -> Option<String> {
    doc.tarball(version)
        .and_then(|reference| reference.strip_prefix('/'))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine, engine::general_purpose::STANDARD};
    use chrono::TimeZone;
    use serde_json::{Value as JsonValue, json};
    use vein_npm_adapter::{FilesystemStorage, MemoryStorage};

    use crate::rewrite::ReferenceRewriter;
    use crate::test_support::{FailingPuts, gzipped_tarball};

    fn registry() -> LocalRegistry<MemoryStorage> {
        LocalRegistry::new(Arc::new(MemoryStorage::new()))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 24, 12, 15, 16).unwrap()
    }

    fn publish_body(name: &str, version: &str, tarball: &str) -> Vec<u8> {
        let short = name.rsplit('/').next().unwrap();
        let file = format!("{short}-{version}.tgz");
        serde_json::to_vec(&json!({
            "name": name,
            "dist-tags": {"latest": version},
            "versions": {version: {"name": name, "version": version}},
            "_attachments": {file: {"data": STANDARD.encode(tarball), "length": tarball.len()}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn publishes_scoped_package_end_to_end() {
        let registry = registry();

        registry
            .publish_at(&publish_body("@hello/simple", "1.0.1", "hello"), now())
            .await
            .unwrap();

        let doc = registry.package("@hello/simple").await.unwrap().unwrap();
        assert_eq!(doc.tarball("1.0.1"), Some("/@hello/simple/-/simple-1.0.1.tgz"));
        assert_eq!(doc.dist_tags["latest"], "1.0.1");
        assert_eq!(doc.time["1.0.1"], "2024-03-24T12:15:16.000Z");
        assert_eq!(
            registry
                .asset("@hello/simple/-/simple-1.0.1.tgz")
                .await
                .unwrap()
                .unwrap(),
            b"hello"
        );

        let served = ReferenceRewriter::client_base_url("http://localhost:8346")
            .rewrite_json(&doc.to_json().unwrap());
        assert_eq!(
            served["versions"]["1.0.1"]["dist"]["tarball"],
            "http://localhost:8346/@hello/simple/-/simple-1.0.1.tgz"
        );
        let stored = registry.package("@hello/simple").await.unwrap().unwrap();
        assert_eq!(stored.tarball("1.0.1"), Some("/@hello/simple/-/simple-1.0.1.tgz"));
    }

    #[tokio::test]
    async fn second_publish_adds_version_and_moves_latest() {
        let registry = registry();
        registry
            .publish_at(&publish_body("pkg", "1.0.0", "one"), now())
            .await
            .unwrap();
        let later = now() + chrono::TimeDelta::days(1);
        let doc = registry
            .publish_at(&publish_body("pkg", "1.1.0", "two"), later)
            .await
            .unwrap();

        assert!(doc.has_version("1.0.0"));
        assert!(doc.has_version("1.1.0"));
        assert_eq!(doc.dist_tags["latest"], "1.1.0");
        assert_eq!(doc.time["created"], "2024-03-24T12:15:16.000Z");
        assert_eq!(doc.time["modified"], "2024-03-25T12:15:16.000Z");
        assert!(doc.dangling_tags().is_empty());
    }

    #[tokio::test]
    async fn malformed_attachment_leaves_storage_untouched() {
        let registry = registry();
        let body = serde_json::to_vec(&json!({
            "name": "pkg",
            "versions": {"1.0.0": {"name": "pkg", "version": "1.0.0"}},
            "_attachments": {"pkg-1.0.0.tgz": {"data": "!!not base64!!"}}
        }))
        .unwrap();

        let err = registry.publish(&body).await.unwrap_err();

        assert!(matches!(err, RegistryError::MalformedPayload(_)));
        assert!(registry.storage().is_empty());
    }

    #[tokio::test]
    async fn invalid_json_is_malformed() {
        let err = registry().publish(b"{").await.unwrap_err();
        assert!(matches!(err, RegistryError::MalformedPayload(_)));
    }

    #[tokio::test]
    async fn dist_tag_lifecycle() {
        let registry = registry();
        registry
            .publish(&publish_body("pkg", "1.0.0", "one"))
            .await
            .unwrap();

        registry.add_dist_tag("pkg", "beta", "1.0.0").await.unwrap();
        let tags = registry.dist_tags("pkg").await.unwrap().unwrap();
        assert_eq!(tags["beta"], "1.0.0");

        let err = registry
            .add_dist_tag("pkg", "next", "2.0.0")
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        registry.remove_dist_tag("pkg", "beta").await.unwrap();
        assert!(
            registry
                .remove_dist_tag("pkg", "beta")
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(
            registry
                .add_dist_tag("ghost", "latest", "1.0.0")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn unpublish_version_deletes_tarball() {
        let registry = registry();
        registry
            .publish(&publish_body("pkg", "1.0.0", "one"))
            .await
            .unwrap();
        registry
            .publish(&publish_body("pkg", "2.0.0", "two"))
            .await
            .unwrap();

        let doc = registry.unpublish_version("pkg", "2.0.0").await.unwrap();

        assert!(!doc.has_version("2.0.0"));
        assert!(!doc.dist_tags.contains_key("latest"));
        assert!(registry.asset("pkg/-/pkg-2.0.0.tgz").await.unwrap().is_none());
        assert!(registry.asset("pkg/-/pkg-1.0.0.tgz").await.unwrap().is_some());
        assert!(
            registry
                .unpublish_version("pkg", "2.0.0")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn unpublish_missing_follows_submitted_document() {
        let registry = registry();
        registry
            .publish(&publish_body("pkg", "1.0.0", "one"))
            .await
            .unwrap();
        let doc = registry
            .publish(&publish_body("pkg", "2.0.0", "two"))
            .await
            .unwrap();

        let mut submitted: JsonValue = doc.to_json().unwrap();
        submitted["versions"].as_object_mut().unwrap().remove("2.0.0");
        submitted["dist-tags"]["latest"] = json!("1.0.0");

        let updated = registry
            .unpublish_missing("pkg", &serde_json::to_vec(&submitted).unwrap())
            .await
            .unwrap();

        assert_eq!(updated.versions.keys().collect::<Vec<_>>(), vec!["1.0.0"]);
        assert_eq!(updated.dist_tags["latest"], "1.0.0");
        assert!(registry.asset("pkg/-/pkg-2.0.0.tgz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unpublish_missing_rejects_other_package() {
        let registry = registry();
        registry
            .publish(&publish_body("pkg", "1.0.0", "one"))
            .await
            .unwrap();
        let body = serde_json::to_vec(&json!({"name": "other", "versions": {}})).unwrap();

        let err = registry.unpublish_missing("pkg", &body).await.unwrap_err();
        assert!(matches!(err, RegistryError::MalformedPayload(_)));
    }

    #[tokio::test]
    async fn force_unpublish_removes_everything() {
        let registry = registry();
        registry
            .publish(&publish_body("@hello/simple", "1.0.1", "hello"))
            .await
            .unwrap();
        registry
            .publish(&publish_body("@hello/simpler", "1.0.0", "other"))
            .await
            .unwrap();

        registry.force_unpublish("@hello/simple").await.unwrap();

        assert!(registry.package("@hello/simple").await.unwrap().is_none());
        assert!(
            registry
                .asset("@hello/simple/-/simple-1.0.1.tgz")
                .await
                .unwrap()
                .is_none()
        );
        assert!(registry.package("@hello/simpler").await.unwrap().is_some());
        assert!(
            registry
                .force_unpublish("@hello/simple")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishes_keep_every_version() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(LocalRegistry::new(Arc::new(FilesystemStorage::new(
            dir.path().to_path_buf(),
        ))));

        let tasks: Vec<_> = (0..8)
            .map(|minor| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let version = format!("1.{minor}.0");
                    registry
                        .publish(&publish_body("pkg", &version, "bytes"))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let doc = registry.package("pkg").await.unwrap().unwrap();
        assert_eq!(doc.versions.len(), 8);
        assert!(doc.dangling_tags().is_empty());
    }

    #[tokio::test]
    async fn invalid_names_read_as_absent() {
        let registry = registry();
        assert!(registry.package("../etc").await.unwrap().is_none());
        assert!(registry.dist_tags("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_document_write_rolls_back_attachments() {
        // The attachment write succeeds, the document write fails
        let registry = LocalRegistry::new(Arc::new(FailingPuts::after(1)));

        let err = registry
            .publish_at(&publish_body("pkg", "1.0.0", "one"), now())
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::Storage(_)));
        assert!(registry.storage().inner.is_empty());
    }

    #[tokio::test]
    async fn failed_republish_restores_previous_tarball() {
        let inner = MemoryStorage::new();
        LocalRegistry::new(Arc::new(inner.clone()))
            .publish_at(&publish_body("pkg", "1.0.0", "one"), now())
            .await
            .unwrap();
        // Overwrite the tarball, fail the document, then put the old bytes back
        let registry = LocalRegistry::new(Arc::new(FailingPuts::wrapping(inner.clone(), 1)));
        let err = registry
            .publish_at(&publish_body("pkg", "1.0.0", "changed"), now())
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::Storage(_)));
        assert_eq!(inner.get("pkg/-/pkg-1.0.0.tgz").await.unwrap().unwrap(), b"one");
    }

    #[tokio::test]
    async fn referenced_tarball_is_not_removed() {
        let registry = registry();
        registry
            .publish(&publish_body("pkg", "1.0.0", "one"))
            .await
            .unwrap();

        let err = registry
            .remove_tarball("pkg", "pkg/-/pkg-1.0.0.tgz")
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::MalformedPayload(_)));
        assert!(registry.asset("pkg/-/pkg-1.0.0.tgz").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn orphaned_tarball_is_removed() {
        let registry = registry();
        registry
            .publish(&publish_body("pkg", "1.0.0", "one"))
            .await
            .unwrap();
        registry
            .storage()
            .put("pkg/-/pkg-0.9.0.tgz", b"stale")
            .await
            .unwrap();

        assert!(
            registry
                .remove_tarball("pkg", "pkg/-/pkg-0.9.0.tgz")
                .await
                .unwrap()
        );
        assert!(
            !registry
                .remove_tarball("pkg", "pkg/-/pkg-0.9.0.tgz")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn tarball_upload_publishes_version() {
        let registry = registry();
        let tarball = gzipped_tarball(&[(
            "package/package.json",
            br#"{"name": "pkg", "version": "2.1.0", "description": "curl"}"#,
        )]);

        let doc = registry
            .publish_tarball("pkg", "pkg-2.1.0.tgz", &tarball)
            .await
            .unwrap();

        assert_eq!(doc.dist_tags["latest"], "2.1.0");
        assert_eq!(doc.tarball("2.1.0"), Some("/pkg/-/pkg-2.1.0.tgz"));
        assert_eq!(
            registry.asset("pkg/-/pkg-2.1.0.tgz").await.unwrap().unwrap(),
            tarball
        );
    }
}
