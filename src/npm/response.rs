use anyhow::{Context, Result, anyhow};
use rama::http::{Body, Response, StatusCode, header};
use serde_json::Value as JsonValue;

use crate::error::RegistryError;
use crate::proxy::CacheMeta;

/// Responds with JSON content
pub fn respond_json(status: StatusCode, body: &JsonValue) -> Result<Response<Body>> {
    let bytes = serde_json::to_vec(body).context("serializing response body")?;
    respond_json_bytes(status, bytes)
}

pub fn respond_json_bytes(status: StatusCode, bytes: Vec<u8>) -> Result<Response<Body>> {
    let mut builder = Response::builder().status(status);
    {
        let headers = builder
            .headers_mut()
            .ok_or_else(|| anyhow!("failed to get headers for json response"))?;
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json; charset=utf-8"),
        );
        headers.insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-cache"),
        );
        headers.insert(
            header::CONTENT_LENGTH,
            header::HeaderValue::from_str(&bytes.len().to_string())?,
        );
    }
    builder.body(Body::from(bytes)).map_err(Into::into)
}

/// `{"error": message}` with the given status.
pub fn respond_error(status: StatusCode, message: &str) -> Result<Response<Body>> {
    respond_json(status, &serde_json::json!({ "error": message }))
}

/// `{"ok": message}`, what npm expects after a successful write.
pub fn respond_ok(status: StatusCode, message: &str) -> Result<Response<Body>> {
    respond_json(status, &serde_json::json!({ "ok": message }))
}

pub fn status_for(err: &RegistryError) -> StatusCode {
    match err {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        RegistryError::Transport(_) => StatusCode::BAD_GATEWAY,
        RegistryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Storage failures are logged in full but reported generically.
pub fn respond_registry_error(err: &RegistryError) -> Result<Response<Body>> {
    let status = status_for(err);
    let message = match err {
        RegistryError::Storage(_) => "internal storage error".to_string(),
        other => other.to_string(),
    };
    respond_error(status, &message)
}

/// Serves tarball bytes. Tarballs never change once published.
pub fn respond_tarball(
    data: Vec<u8>,
    meta: Option<&CacheMeta>,
    file_name: &str,
) -> Result<Response<Body>> {
    let mut builder = Response::builder().status(StatusCode::OK);
    {
        let headers = builder
            .headers_mut()
            .ok_or_else(|| anyhow!("failed to get headers for tarball response"))?;
        headers.insert(
            header::CONTENT_LENGTH,
            header::HeaderValue::from_str(&data.len().to_string())?,
        );
        let content_type = meta
            .and_then(|meta| meta.content_type.as_deref())
            .unwrap_or("application/octet-stream");
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_str(content_type)?,
        );
        headers.insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("public, max-age=31536000, immutable"),
        );
        if let Some(sha256) = meta.and_then(|meta| meta.sha256.as_deref()) {
            headers.insert(
                header::HeaderName::from_static("x-checksum-sha256"),
                header::HeaderValue::from_str(sha256)?,
            );
        }
        if let Some(last_modified) = meta.and_then(|meta| meta.last_modified.as_deref()) {
            headers.insert(
                header::LAST_MODIFIED,
                header::HeaderValue::from_str(last_modified)?,
            );
        }
        let download_name = file_name.rsplit('/').next().unwrap_or(file_name);
        headers.insert(
            header::CONTENT_DISPOSITION,
            header::HeaderValue::from_str(&format!("attachment; filename=\"{download_name}\""))?,
        );
    }

    builder.body(Body::from(data)).map_err(Into::into)
}

/// HEAD answers: same status and headers, no body.
pub fn without_body(response: Response<Body>) -> Response<Body> {
    let (parts, _) = response.into_parts();
    Response::from_parts(parts, Body::empty())
}
