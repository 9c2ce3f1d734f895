//! Request handlers for the registry facade's HTTP front-end (§4.I).
//!
//! The OCI distribution spec's `{name}` path segment can itself contain slashes, so
//! [`dispatch`] parses the wildcard tail captured by [`crate::route::create_router`] by hand
//! rather than relying on axum's segment-based path extractors.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use oci_spec::image::Digest;
use registry_facade_core::{
    config_modifier::ConfigOverrides,
    router::{BlobRouter, ByteRange},
    synth::Synthesized,
    CoreError,
};

use crate::{
    error::{ServerError, ServerResult},
    state::AppState,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The operation named by the second-to-last path segment of a `/v2/...` request.
enum Operation {
    Manifests,
    Blobs,
}

static DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// `GET /v2/` — the base endpoint clients use to probe support for this API version.
pub async fn check() -> impl IntoResponse {
    (StatusCode::OK, axum::Json(serde_json::json!({})))
}

/// `/v2/{*tail}` — dispatches to manifest or blob handling based on the parsed operation.
pub async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    Path(tail): Path<String>,
    headers: HeaderMap,
) -> Response {
    match route_request(&state, &method, &tail, &headers).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// Any request that doesn't match a registered route.
pub async fn unsupported() -> ServerError {
    ServerError::Unsupported
}

//--------------------------------------------------------------------------------------------------
// Functions: Routing
//--------------------------------------------------------------------------------------------------

async fn route_request(
    state: &AppState,
    method: &Method,
    tail: &str,
    headers: &HeaderMap,
) -> ServerResult<Response> {
    let Some((name, operation, selector)) = parse_tail(tail) else {
        return Err(ServerError::Unsupported);
    };

    match (method, operation) {
        (&Method::GET, Operation::Manifests) => get_manifest(state, &name, selector, false).await,
        (&Method::HEAD, Operation::Manifests) => get_manifest(state, &name, selector, true).await,
        (&Method::GET, Operation::Blobs) => get_blob(state, &name, selector, headers, false).await,
        (&Method::HEAD, Operation::Blobs) => get_blob(state, &name, selector, headers, true).await,
        _ => Err(ServerError::Unsupported),
    }
}

/// Splits a `/v2/`-relative tail of the form `<name>/manifests/<reference>` or
/// `<name>/blobs/<digest>` into its three parts. `<name>` may itself contain slashes, so this
/// looks at the last two segments to find the operation rather than the first.
fn parse_tail(tail: &str) -> Option<(String, Operation, &str)> {
    let segments: Vec<&str> = tail.split('/').collect();
    if segments.len() < 3 {
        return None;
    }

    let selector = segments[segments.len() - 1];
    let operation = match segments[segments.len() - 2] {
        "manifests" => Operation::Manifests,
        "blobs" => Operation::Blobs,
        _ => return None,
    };

    let name = segments[..segments.len() - 2].join("/");
    if name.is_empty() {
        return None;
    }

    Some((name, operation, selector))
}

/// Splits `<name>` on its first `/` into `(provider-name, remainder)` (§4.I).
fn split_name(name: &str) -> ServerResult<(&str, &str)> {
    name.split_once('/')
        .ok_or_else(|| CoreError::NameUnknown(name.to_string()).into())
}

//--------------------------------------------------------------------------------------------------
// Functions: Manifests
//--------------------------------------------------------------------------------------------------

async fn get_manifest(
    state: &AppState,
    name: &str,
    reference: &str,
    head_only: bool,
) -> ServerResult<Response> {
    let (provider_name, remainder) = split_name(name)?;
    let provider = state
        .get_spec_providers()
        .get(provider_name)
        .ok_or_else(|| CoreError::NameUnknown(provider_name.to_string()))?;
    let spec = provider.get_spec(remainder).await?;

    let composite = Arc::new(state.build_composite(&spec));
    let overrides = ConfigOverrides {
        env_vars: spec.get_env_vars().clone(),
        entrypoint: spec.get_entrypoint().clone(),
        cmd: spec.get_cmd().clone(),
        user: spec.get_user().clone(),
    };

    let synthesized = state
        .get_synthesizer()
        .synthesize(&spec, composite, overrides)
        .await?;

    if let Ok(requested) = reference.parse::<Digest>()
        && requested != synthesized.manifest_digest
    {
        return Err(CoreError::ManifestUnknown(reference.to_string()).into());
    }

    persist_synthesized(state, &synthesized).await?;

    let body = if head_only {
        Body::empty()
    } else {
        Body::from(synthesized.manifest_bytes.clone())
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, registry_facade_utils::OCI_MANIFEST_MEDIA_TYPE)
        .header(header::CONTENT_LENGTH, synthesized.manifest_bytes.len())
        .header(DOCKER_CONTENT_DIGEST.clone(), synthesized.manifest_digest.to_string())
        .body(body)
        .map_err(|err| ServerError::Internal(err.to_string()))
}

/// Commits a synthesized manifest/config pair into the blob store so that subsequent blob GETs
/// for either digest are served directly from (A) rather than re-running synthesis. A no-op if
/// the digest is already present (`BlobWriter::commit` discards the duplicate write).
async fn persist_synthesized(state: &AppState, synthesized: &Synthesized) -> ServerResult<()> {
    commit_blob(state, &synthesized.config_digest, &synthesized.config_bytes).await?;
    commit_blob(state, &synthesized.manifest_digest, &synthesized.manifest_bytes).await?;
    Ok(())
}

async fn commit_blob(state: &AppState, digest: &Digest, bytes: &Bytes) -> ServerResult<()> {
    if state.get_store().has(digest) {
        return Ok(());
    }

    let mut writer = state.get_store().writer(Some(digest.clone())).await?;
    writer.write_all(bytes).await?;
    writer.commit().await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Blobs
//--------------------------------------------------------------------------------------------------

async fn get_blob(
    state: &AppState,
    name: &str,
    digest: &str,
    headers: &HeaderMap,
    head_only: bool,
) -> ServerResult<Response> {
    let (provider_name, remainder) = split_name(name)?;
    let provider = state
        .get_spec_providers()
        .get(provider_name)
        .ok_or_else(|| CoreError::NameUnknown(provider_name.to_string()))?;
    let spec = provider.get_spec(remainder).await?;

    let digest: Digest = digest
        .parse()
        .map_err(|_| CoreError::custom(anyhow::anyhow!("malformed digest: {digest}")))?;

    let range = parse_range_header(headers)?;

    let composite = Arc::new(state.build_composite(&spec));
    let router = BlobRouter::new(state.get_store().clone(), composite);
    let routed = router.route(&digest, range).await?;

    let mut builder = Response::builder().header(header::CONTENT_TYPE, "application/octet-stream");
    builder = match routed.content_range {
        Some((start, end, total)) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}"))
            .header(header::CONTENT_LENGTH, routed.content_length),
        None => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, routed.content_length),
    };
    builder = builder.header(DOCKER_CONTENT_DIGEST.clone(), digest.to_string());

    let body = if head_only {
        Body::empty()
    } else {
        Body::from_stream(routed.stream)
    };

    builder
        .body(body)
        .map_err(|err| ServerError::Internal(err.to_string()))
}

/// Parses a single-range `Range: bytes=<start>-<end>` header. Multi-range and suffix-range
/// (`bytes=-500`) requests are not supported and are rejected as invalid.
fn parse_range_header(headers: &HeaderMap) -> ServerResult<Option<ByteRange>> {
    let Some(value) = headers.get(header::RANGE) else {
        return Ok(None);
    };

    let value = value
        .to_str()
        .map_err(|_| ServerError::InvalidRange("non-utf8 Range header".to_string()))?;
    let spec = value
        .strip_prefix("bytes=")
        .ok_or_else(|| ServerError::InvalidRange(value.to_string()))?;
    let (start, end) = spec
        .split_once('-')
        .ok_or_else(|| ServerError::InvalidRange(value.to_string()))?;

    let start: u64 = start
        .parse()
        .map_err(|_| ServerError::InvalidRange(value.to_string()))?;
    let end_inclusive: u64 = end
        .parse()
        .map_err(|_| ServerError::InvalidRange(value.to_string()))?;

    Ok(Some(ByteRange { start, end_inclusive }))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tail_splits_multi_segment_name() {
        let (name, operation, selector) = parse_tail("static/ide/manifests/any").unwrap();
        assert_eq!(name, "static/ide");
        assert!(matches!(operation, Operation::Manifests));
        assert_eq!(selector, "any");
    }

    #[test]
    fn parse_tail_splits_blobs() {
        let (name, operation, selector) =
            parse_tail("remote/acme/alice/blobs/sha256:aaaa").unwrap();
        assert_eq!(name, "remote/acme/alice");
        assert!(matches!(operation, Operation::Blobs));
        assert_eq!(selector, "sha256:aaaa");
    }

    #[test]
    fn parse_tail_rejects_unknown_operation() {
        assert!(parse_tail("static/ide/tags/list").is_none());
    }

    #[test]
    fn parse_tail_rejects_too_few_segments() {
        assert!(parse_tail("manifests/x").is_none());
    }

    #[test]
    fn split_name_splits_on_first_slash() {
        let (provider, remainder) = split_name("remote/acme/alice").unwrap();
        assert_eq!(provider, "remote");
        assert_eq!(remainder, "acme/alice");
    }

    #[test]
    fn split_name_rejects_bare_name() {
        assert!(split_name("onlyname").is_err());
    }

    #[test]
    fn parse_range_header_parses_bytes_range() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, "bytes=2-4".parse().unwrap());
        let range = parse_range_header(&headers).unwrap().unwrap();
        assert_eq!(range.start, 2);
        assert_eq!(range.end_inclusive, 4);
    }

    #[test]
    fn parse_range_header_absent_is_none() {
        let headers = HeaderMap::new();
        assert!(parse_range_header(&headers).unwrap().is_none());
    }
}
