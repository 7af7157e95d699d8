//! npm registry HTTP surface
//!
//! Serves the hosted registry (publish, dist-tags, unpublish) or the
//! read-through proxy cache behind the same routes.

use std::sync::Arc;

use rama::{
    Service,
    error::BoxError,
    http::{Body, Method, Request, Response, StatusCode, body::util::BodyExt, header},
};
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};
use vein_npm_adapter::BlobStore;

use super::response::{
    respond_error, respond_json, respond_ok, respond_registry_error, respond_tarball,
    without_body,
};
use super::types::{CacheStatus, NpmTarget, RequestContext};
use crate::archive;
use crate::error::{RegistryError, Result};
use crate::proxy::{ProxyCache, RemoteClient};
use crate::registry::LocalRegistry;
use crate::rewrite::ReferenceRewriter;

/// Which engine answers requests.
pub enum Backend<S, R> {
    Hosted(LocalRegistry<S>),
    Proxy(ProxyCache<S, R>),
}

struct ServiceState<S, R> {
    backend: Backend<S, R>,
    /// Absolute URL clients reach us at, without the mount prefix.
    base_url: Option<String>,
    /// Mount prefix without surrounding slashes.
    prefix: Option<String>,
}

pub struct NpmService<S, R> {
    state: Arc<ServiceState<S, R>>,
}

impl<S, R> Clone for NpmService<S, R> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<S, R> NpmService<S, R>
where
    S: BlobStore + 'static,
    R: RemoteClient + 'static,
{
    pub fn new(backend: Backend<S, R>, base_url: Option<String>, prefix: Option<String>) -> Self {
        let prefix = prefix
            .map(|prefix| prefix.trim_matches('/').to_string())
            .filter(|prefix| !prefix.is_empty());
        let base_url = base_url.map(|url| url.trim_end_matches('/').to_string());
        Self {
            state: Arc::new(ServiceState {
                backend,
                base_url,
                prefix,
            }),
        }
    }

    pub fn backend(&self) -> &Backend<S, R> {
        &self.state.backend
    }

    /// Closes the upstream client when running as a proxy.
    pub async fn close(&self) {
        if let Backend::Proxy(cache) = &self.state.backend {
            cache.close().await;
        }
    }

    /// Path below the mount prefix, or `None` when the request is outside it.
    fn registry_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        let Some(prefix) = self.state.prefix.as_deref() else {
            return Some(path);
        };
        let rest = path.trim_start_matches('/').strip_prefix(prefix)?;
        if rest.is_empty() || rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    /// Chooses how stored references are presented to this client.
    fn rewriter(&self, req: &Request<Body>) -> ReferenceRewriter {
        let mount = self
            .state
            .prefix
            .as_deref()
            .map(|prefix| format!("/{prefix}"))
            .unwrap_or_default();
        if let Some(base) = &self.state.base_url {
            return ReferenceRewriter::client_base_url(format!("{base}{mount}"));
        }
        match req
            .headers()
            .get(header::HOST)
            .and_then(|host| host.to_str().ok())
        {
            Some(host) => ReferenceRewriter::client_base_url(format!("http://{host}{mount}")),
            None => ReferenceRewriter::repository_prefix(mount),
        }
    }

    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &mut RequestContext,
    ) -> anyhow::Result<Response<Body>> {
        let head = *req.method() == Method::HEAD;
        let response = self.route(req, ctx).await?;
        Ok(if head { without_body(response) } else { response })
    }

    async fn route(
        &self,
        req: Request<Body>,
        ctx: &mut RequestContext,
    ) -> anyhow::Result<Response<Body>> {
        let target = self
            .registry_path(req.uri().path())
            .and_then(NpmTarget::from_path);
        let Some(target) = target else {
            return respond_error(StatusCode::NOT_FOUND, "not found");
        };

        let outcome = match &self.state.backend {
            Backend::Hosted(registry) => self.hosted(registry, req, target).await,
            Backend::Proxy(cache) => self.proxied(cache, req, target, ctx).await,
        };

        match outcome {
            Ok(response) => Ok(response),
            Err(err) => {
                if matches!(self.state.backend, Backend::Proxy(_)) {
                    ctx.cache = CacheStatus::Error;
                }
                match &err {
                    RegistryError::Storage(inner) => {
                        error!(summary = %ctx.summary(), error = ?inner, "storage failure");
                    }
                    RegistryError::Transport(reason) => {
                        warn!(summary = %ctx.summary(), reason = %reason, "upstream unavailable");
                    }
                    _ => {}
                }
                respond_registry_error(&err)
            }
        }
    }

    async fn hosted(
        &self,
        registry: &LocalRegistry<S>,
        req: Request<Body>,
        target: NpmTarget,
    ) -> Result<Response<Body>> {
        let method = req.method().clone();
        let response = match (method, target) {
            (Method::GET | Method::HEAD, NpmTarget::Ping) => {
                respond_json(StatusCode::OK, &serde_json::json!({}))?
            }
            (Method::GET | Method::HEAD, NpmTarget::Package { name }) => {
                let doc = registry
                    .package(&name)
                    .await?
                    .ok_or_else(|| RegistryError::not_found(format!("package {name}")))?;
                let body = self.rewriter(&req).rewrite_json(&doc.to_json()?);
                respond_json(StatusCode::OK, &body)?
            }
            (Method::GET | Method::HEAD, NpmTarget::Version { name, version }) => {
                let doc = registry
                    .package(&name)
                    .await?
                    .ok_or_else(|| RegistryError::not_found(format!("package {name}")))?;
                let descriptor = version_document(&doc.to_json()?, &name, &version)?;
                respond_json(StatusCode::OK, &self.rewriter(&req).rewrite_json(&descriptor))?
            }
            (Method::GET | Method::HEAD, target @ NpmTarget::Tarball { .. }) => {
                let key = asset_key(&target)?;
                let data = registry
                    .asset(&key)
                    .await?
                    .ok_or_else(|| RegistryError::not_found(format!("tarball {key}")))?;
                respond_tarball(data, None, &key)?
            }
            (Method::PUT, NpmTarget::Package { name }) => {
                let body = read_body(req).await?;
                ensure_payload_name(&body, &name)?;
                let doc = registry.publish(&body).await?;
                info!(package = %doc.name, versions = doc.versions.len(), "package published");
                respond_ok(StatusCode::CREATED, "created new package")?
            }
            (Method::PUT, NpmTarget::Tarball { name, file }) if file.ends_with(".tgz") => {
                let body = read_body(req).await?;
                let doc = registry.publish_tarball(&name, &file, &body).await?;
                info!(package = %doc.name, file = %file, "tarball published");
                respond_ok(StatusCode::CREATED, "created new package")?
            }
            (Method::PUT, NpmTarget::Revision { name, .. }) => {
                let body = read_body(req).await?;
                registry.unpublish_missing(&name, &body).await?;
                respond_ok(StatusCode::CREATED, "updated package")?
            }
            (Method::DELETE, NpmTarget::Revision { name, .. }) => {
                registry.force_unpublish(&name).await?;
                respond_ok(StatusCode::OK, "deleted package")?
            }
            (Method::DELETE, NpmTarget::TarballRevision { name, file, .. }) => {
                // Only after the revision PUT has dropped every version using it
                registry
                    .remove_tarball(&name, &archive::asset_key(&name, &file))
                    .await?;
                respond_ok(StatusCode::OK, "deleted tarball")?
            }
            (Method::GET | Method::HEAD, NpmTarget::DistTags { name }) => {
                let tags = registry
                    .dist_tags(&name)
                    .await?
                    .ok_or_else(|| RegistryError::not_found(format!("package {name}")))?;
                respond_json(StatusCode::OK, &serde_json::json!(tags))?
            }
            (Method::PUT | Method::POST, NpmTarget::DistTag { name, tag }) => {
                let body = read_body(req).await?;
                let version: String = serde_json::from_slice(&body).map_err(|err| {
                    RegistryError::malformed(format!(
                        "dist-tag body must be a version string: {err}"
                    ))
                })?;
                registry.add_dist_tag(&name, &tag, &version).await?;
                respond_ok(StatusCode::CREATED, "dist-tags updated")?
            }
            (Method::DELETE, NpmTarget::DistTag { name, tag }) => {
                registry.remove_dist_tag(&name, &tag).await?;
                respond_ok(StatusCode::OK, "dist-tags updated")?
            }
            _ => respond_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")?,
        };
        Ok(response)
    }

    async fn proxied(
        &self,
        cache: &ProxyCache<S, R>,
        req: Request<Body>,
        target: NpmTarget,
        ctx: &mut RequestContext,
    ) -> Result<Response<Body>> {
        if !matches!(*req.method(), Method::GET | Method::HEAD) {
            return Ok(respond_error(
                StatusCode::METHOD_NOT_ALLOWED,
                "registry is a read-only mirror",
            )?);
        }

        let response = match target {
            NpmTarget::Ping => respond_json(StatusCode::OK, &serde_json::json!({}))?,
            NpmTarget::Package { ref name } | NpmTarget::Version { ref name, .. } => {
                let entry = cache
                    .get_package(name)
                    .await?
                    .ok_or_else(|| RegistryError::not_found(format!("package {name}")))?;
                ctx.cache = if entry.meta.last_refreshed >= ctx.received_at {
                    CacheStatus::Miss
                } else {
                    CacheStatus::Hit
                };
                let doc = entry.document()?;
                let body = match &target {
                    NpmTarget::Version { version, .. } => version_document(&doc, name, version)?,
                    _ => doc,
                };
                respond_json(StatusCode::OK, &self.rewriter(&req).rewrite_json(&body))?
            }
            target @ NpmTarget::Tarball { .. } => {
                let key = asset_key(&target)?;
                let entry = cache
                    .get_asset(&key)
                    .await?
                    .ok_or_else(|| RegistryError::not_found(format!("tarball {key}")))?;
                ctx.cache = if entry.meta.last_refreshed >= ctx.received_at {
                    CacheStatus::Miss
                } else {
                    CacheStatus::Hit
                };
                respond_tarball(entry.value, Some(&entry.meta), &key)?
            }
            _ => respond_error(StatusCode::NOT_FOUND, "not available on a mirror")?,
        };
        Ok(response)
    }
}

impl<S, R> Service<Request<Body>> for NpmService<S, R>
where
    S: BlobStore + 'static,
    R: RemoteClient + 'static,
{
    type Output = Response<Body>;
    type Error = BoxError;

    async fn serve(&self, req: Request<Body>) -> std::result::Result<Self::Output, Self::Error> {
        let mut ctx = RequestContext::from_request(&req);

        let result = self.handle(req, &mut ctx).await;

        match &result {
            Ok(resp) => {
                let response_code = resp.status().as_u16();
                let duration_ms = ctx.start.elapsed().as_millis();
                info!(
                    summary = %ctx.summary(),
                    response_code,
                    duration_ms,
                    cache_status = %ctx.cache,
                    "request handled"
                );
            }
            Err(err) => {
                let duration_ms = ctx.start.elapsed().as_millis();
                error!(
                    summary = %ctx.summary(),
                    duration_ms,
                    cache_status = %ctx.cache,
                    error = %err,
                    "request failed"
                );
            }
        }

        result.map_err(|e| e.into())
    }
}

async fn read_body(req: Request<Body>) -> Result<Vec<u8>> {
    let collected = req
        .into_body()
        .collect()
        .await
        .map_err(|err| RegistryError::malformed(format!("reading request body: {err}")))?;
    Ok(collected.to_bytes().to_vec())
}

fn asset_key(target: &NpmTarget) -> Result<String> {
    target
        .asset_key()
        .ok_or_else(|| RegistryError::not_found("tarball"))
}

/// A publish must land on the route of the package it names.
fn ensure_payload_name(body: &[u8], name: &str) -> Result<()> {
    let payload: JsonValue = serde_json::from_slice(body)
        .map_err(|err| RegistryError::malformed(format!("invalid publish payload: {err}")))?;
    match payload.get("name").and_then(JsonValue::as_str) {
        Some(submitted) if submitted != name => Err(RegistryError::malformed(format!(
            "payload for {submitted:?} submitted to {name}"
        ))),
        _ => Ok(()),
    }
}

/// Looks `requested` up as a dist-tag first, then as a version.
fn version_document(doc: &JsonValue, name: &str, requested: &str) -> Result<JsonValue> {
    let version = doc
        .get("dist-tags")
        .and_then(|tags| tags.get(requested))
        .and_then(JsonValue::as_str)
        .unwrap_or(requested);
    doc.get("versions")
        .and_then(|versions| versions.get(version))
        .cloned()
        .ok_or_else(|| RegistryError::not_found(format!("{name}@{requested}")))
}
