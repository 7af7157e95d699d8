//! Tarball attachments carried inside a publish payload, and raw tarball
//! uploads turned into one.

use std::io::Read;

use base64::{Engine, engine::general_purpose::STANDARD};
use flate2::read::GzDecoder;
use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha512};
use tar::Archive;
use tracing::{debug, warn};
use vein_npm_adapter::BlobStore;

use crate::error::{RegistryError, Result};
use crate::metadata::{PublishPayload, is_safe_relative};

/// A decoded attachment, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAttachment {
    pub key: String,
    pub bytes: Vec<u8>,
}

/// Storage key of an attachment: `{name}/-/{filename}`.
pub fn asset_key(name: &str, filename: &str) -> String {
    format!("{name}/-/{filename}")
}

/// Decodes every attachment of `payload` without touching storage.
///
/// Any failure rejects the whole payload.
pub fn decode_attachments(payload: &PublishPayload) -> Result<Vec<DecodedAttachment>> {
    payload
        .attachments
        .iter()
        .map(|(filename, attachment)| {
            if !is_safe_relative(filename) {
                return Err(RegistryError::malformed(format!(
                    "unsafe attachment name {filename:?}"
                )));
            }
            let bytes = STANDARD.decode(attachment.data.trim()).map_err(|err| {
                RegistryError::malformed(format!("attachment {filename} is not base64: {err}"))
            })?;
            if let Some(length) = attachment.length
                && length != bytes.len() as u64
            {
                return Err(RegistryError::malformed(format!(
                    "attachment {filename} declares {length} bytes but decodes to {}",
                    bytes.len()
                )));
            }
            Ok(DecodedAttachment {
                key: asset_key(&payload.name, filename),
                bytes,
            })
        })
        .collect()
}

/// Attachments written by one publish, with whatever each key held before.
#[derive(Debug, Default)]
pub struct StoredAttachments {
    written: Vec<(String, Option<Vec<u8>>)>,
}

impl StoredAttachments {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.written.iter().map(|(key, _)| key.as_str())
    }

    pub fn len(&self) -> usize {
        self.written.len()
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
    }

    /// Puts every key back the way it was before the publish.
    pub async fn roll_back<S: BlobStore>(self, storage: &S) {
        for (key, previous) in self.written.into_iter().rev() {
            let restored = match previous {
                Some(bytes) => storage.put(&key, &bytes).await,
                None => storage.delete(&key).await.map(|_| ()),
            };
            match restored {
                Ok(()) => debug!(key = %key, "rolled back attachment"),
                Err(err) => warn!(key = %key, error = %err, "failed to roll back attachment"),
            }
        }
    }
}

/// Decodes and persists every attachment.
///
/// Decoding happens up front, so a malformed attachment means no writes.
pub async fn extract_and_store<S: BlobStore>(
    storage: &S,
    payload: &PublishPayload,
) -> Result<StoredAttachments> {
    let decoded = decode_attachments(payload)?;
    store_attachments(storage, decoded).await
}

/// Writes `attachments` in order. A failed write undoes the earlier ones.
pub async fn store_attachments<S: BlobStore>(
    storage: &S,
    attachments: Vec<DecodedAttachment>,
) -> Result<StoredAttachments> {
    let mut stored = StoredAttachments::default();
    for attachment in attachments {
        let written = match storage.get(&attachment.key).await {
            Ok(previous) => storage
                .put(&attachment.key, &attachment.bytes)
                .await
                .map(|()| previous),
            Err(err) => Err(err),
        };
        match written {
            Ok(previous) => {
                debug!(key = %attachment.key, size = attachment.bytes.len(), "stored attachment");
                stored.written.push((attachment.key, previous));
            }
            Err(err) => {
                stored.roll_back(storage).await;
                return Err(err.into());
            }
        }
    }
    Ok(stored)
}

/// Turns a raw `.tgz` upload into an npm publish body.
///
/// The version descriptor is `package/package.json` from inside the
/// tarball; the tarball itself becomes the single attachment `file`.
pub fn publish_body_from_tarball(name: &str, file: &str, tarball: &[u8]) -> Result<Vec<u8>> {
    let mut manifest = read_manifest(tarball)?;
    let Some(fields) = manifest.as_object_mut() else {
        return Err(RegistryError::malformed("package.json is not an object"));
    };
    match fields.get("name").and_then(JsonValue::as_str) {
        Some(declared) if declared == name => {}
        Some(declared) => {
            return Err(RegistryError::malformed(format!(
                "tarball for {declared:?} uploaded to {name}"
            )));
        }
        None => return Err(RegistryError::malformed("package.json has no name")),
    }
    let version = fields
        .get("version")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| RegistryError::malformed("package.json has no version"))?;

    let integrity = format!("sha512-{}", STANDARD.encode(Sha512::digest(tarball)));
    fields.insert(
        "dist".to_string(),
        json!({"tarball": format!("/{}", asset_key(name, file)), "integrity": integrity}),
    );

    let body = json!({
        "name": name,
        "dist-tags": {"latest": version},
        "versions": {version: manifest},
        "_attachments": {
            file: {
                "content_type": "application/octet-stream",
                "data": STANDARD.encode(tarball),
                "length": tarball.len(),
            }
        },
    });
    serde_json::to_vec(&body)
        .map_err(|err| RegistryError::malformed(format!("encoding publish body: {err}")))
}

/// Reads the top-level `*/package.json` entry of a gzipped tarball.
fn read_manifest(tarball: &[u8]) -> Result<JsonValue> {
    let unreadable = |err: std::io::Error| {
        RegistryError::malformed(format!("tarball is not a readable .tgz: {err}"))
    };
    let mut archive = Archive::new(GzDecoder::new(tarball));
    for entry in archive.entries().map_err(unreadable)? {
        let mut entry = entry.map_err(unreadable)?;
        let path = entry.path().map_err(unreadable)?.into_owned();
        let is_manifest = path.components().count() == 2
            && path.file_name().is_some_and(|file| file == "package.json");
        if !is_manifest {
            continue;
        }
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw).map_err(unreadable)?;
        return serde_json::from_slice(&raw)
            .map_err(|err| RegistryError::malformed(format!("package.json is not JSON: {err}")));
    }
    Err(RegistryError::malformed("tarball has no package/package.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FailingPuts, gzipped_tarball};
    use vein_npm_adapter::MemoryStorage;

    fn payload(attachments: serde_json::Value) -> PublishPayload {
        let body = json!({
            "name": "@hello/simple",
            "versions": {"1.0.1": {"name": "@hello/simple", "version": "1.0.1"}},
            "_attachments": attachments,
        });
        PublishPayload::from_slice(&serde_json::to_vec(&body).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn stores_decoded_attachment() {
        let storage = MemoryStorage::new();
        let upload = payload(json!({"simple-1.0.1.tgz": {"data": STANDARD.encode("hello")}}));

        let stored = extract_and_store(&storage, &upload).await.unwrap();

        assert_eq!(
            stored.keys().collect::<Vec<_>>(),
            vec!["@hello/simple/-/simple-1.0.1.tgz"]
        );
        let stored = storage
            .get("@hello/simple/-/simple-1.0.1.tgz")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, b"hello");
    }

    #[tokio::test]
    async fn binary_attachment_round_trips() {
        let original: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let storage = MemoryStorage::new();
        let upload = payload(json!({
            "simple-1.0.1.tgz": {"data": STANDARD.encode(&original), "length": original.len()}
        }));

        extract_and_store(&storage, &upload).await.unwrap();

        let stored = storage
            .get("@hello/simple/-/simple-1.0.1.tgz")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, original);
    }

    #[tokio::test]
    async fn invalid_base64_writes_nothing() {
        let storage = MemoryStorage::new();
        let upload = payload(json!({
            "a-1.0.1.tgz": {"data": STANDARD.encode("fine")},
            "b-1.0.1.tgz": {"data": "%%% not base64 %%%"}
        }));

        let err = extract_and_store(&storage, &upload).await.unwrap_err();

        assert!(matches!(err, RegistryError::MalformedPayload(_)));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn length_mismatch_is_rejected() {
        let storage = MemoryStorage::new();
        let upload = payload(json!({
            "simple-1.0.1.tgz": {"data": STANDARD.encode("hello"), "length": 4}
        }));

        let err = extract_and_store(&storage, &upload).await.unwrap_err();
        assert!(matches!(err, RegistryError::MalformedPayload(_)));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn failed_write_removes_earlier_attachments() {
        let storage = FailingPuts::after(1);
        let attachments = vec![
            DecodedAttachment {
                key: "pkg/-/a-1.0.0.tgz".to_string(),
                bytes: b"a".to_vec(),
            },
            DecodedAttachment {
                key: "pkg/-/b-1.0.0.tgz".to_string(),
                bytes: b"b".to_vec(),
            },
        ];

        let err = store_attachments(&storage, attachments).await.unwrap_err();

        assert!(matches!(err, RegistryError::Storage(_)));
        assert!(storage.inner.is_empty());
    }

    #[tokio::test]
    async fn roll_back_restores_overwritten_bytes() {
        let storage = MemoryStorage::new();
        storage.put("pkg/-/a-1.0.0.tgz", b"old").await.unwrap();
        let attachments = vec![DecodedAttachment {
            key: "pkg/-/a-1.0.0.tgz".to_string(),
            bytes: b"new".to_vec(),
        }];

        let stored = store_attachments(&storage, attachments).await.unwrap();
        assert_eq!(stored.len(), 1);
        stored.roll_back(&storage).await;

        let restored = storage.get("pkg/-/a-1.0.0.tgz").await.unwrap().unwrap();
        assert_eq!(restored, b"old");
    }

    #[test]
    fn traversal_in_attachment_name_is_rejected() {
        let upload = payload(json!({"../../escape.tgz": {"data": STANDARD.encode("x")}}));
        assert!(matches!(
            decode_attachments(&upload).unwrap_err(),
            RegistryError::MalformedPayload(_)
        ));
    }

    #[test]
    fn scoped_attachment_names_nest_under_package() {
        let upload = payload(json!({"@hello/simple-1.0.1.tgz": {"data": STANDARD.encode("x")}}));
        let decoded = decode_attachments(&upload).unwrap();
        assert_eq!(decoded[0].key, "@hello/simple/-/@hello/simple-1.0.1.tgz");
    }

    #[test]
    fn tarball_upload_becomes_publish_body() {
        let tarball = gzipped_tarball(&[(
            "package/package.json",
            br#"{"name": "@hello/simple", "version": "1.0.2", "main": "index.js"}"#,
        )]);

        let body =
            publish_body_from_tarball("@hello/simple", "simple-1.0.2.tgz", &tarball).unwrap();
        let payload = PublishPayload::from_slice(&body).unwrap();

        assert_eq!(payload.dist_tags["latest"], "1.0.2");
        let descriptor = &payload.versions["1.0.2"];
        assert_eq!(descriptor["main"], "index.js");
        assert_eq!(
            descriptor["dist"]["tarball"],
            "/@hello/simple/-/simple-1.0.2.tgz"
        );
        assert!(
            descriptor["dist"]["integrity"]
                .as_str()
                .unwrap()
                .starts_with("sha512-")
        );
        let decoded = decode_attachments(&payload).unwrap();
        assert_eq!(decoded[0].key, "@hello/simple/-/simple-1.0.2.tgz");
        assert_eq!(decoded[0].bytes, tarball);
    }

    #[test]
    fn tarball_for_another_package_is_rejected() {
        let tarball = gzipped_tarball(&[(
            "package/package.json",
            br#"{"name": "other", "version": "1.0.0"}"#,
        )]);
        let err = publish_body_from_tarball("pkg", "pkg-1.0.0.tgz", &tarball).unwrap_err();
        assert!(matches!(err, RegistryError::MalformedPayload(_)));
    }

    #[test]
    fn tarball_without_manifest_is_rejected() {
        let tarball = gzipped_tarball(&[("package/index.js", b"module.exports = 1;")]);
        let err = publish_body_from_tarball("pkg", "pkg-1.0.0.tgz", &tarball).unwrap_err();
        assert!(matches!(err, RegistryError::MalformedPayload(_)));

        let err = publish_body_from_tarball("pkg", "pkg-1.0.0.tgz", b"plain bytes").unwrap_err();
        assert!(matches!(err, RegistryError::MalformedPayload(_)));
    }

    #[test]
    fn nested_package_json_is_not_the_manifest() {
        let tarball = gzipped_tarball(&[
            (
                "package/node_modules/dep/package.json",
                br#"{"name": "dep", "version": "9.9.9"}"#.as_slice(),
            ),
            (
                "package/package.json",
                br#"{"name": "pkg", "version": "1.0.0"}"#.as_slice(),
            ),
        ]);
        let body = publish_body_from_tarball("pkg", "pkg-1.0.0.tgz", &tarball).unwrap();
        let payload = PublishPayload::from_slice(&body).unwrap();
        assert!(payload.versions.contains_key("1.0.0"));
    }
}
