//! `registry_facade_server::error` is a module containing error utilities for the HTTP front-end.
//!
//! Every [`ServerError`] renders as the registry v2 error envelope (§4.I):
//! `{"errors": [{"code", "message", "detail"?}]}`, with the HTTP status mapped per §7's table.
//! Stack traces never leak into the body — `pretty_error_debug::Debug` is for CLI-side rendering
//! only (§7).

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use registry_facade_core::CoreError;
use serde::Serialize;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a `registry-facade-server` operation.
pub type ServerResult<T> = Result<T, ServerError>;

/// An error surfaced at the HTTP boundary, rendered as a registry v2 error envelope.
#[derive(pretty_error_debug::Debug, Error)]
pub enum ServerError {
    /// An error from the synthesis pipeline, mapped to a registry v2 code per §7.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// An error raised while coordinating listener handover.
    #[error("handover error: {0}")]
    Handover(#[from] registry_facade_handover::HandoverError),

    /// The client's `Range` header could not be parsed.
    #[error("invalid range header: {0}")]
    InvalidRange(String),

    /// The request did not match any route this facade serves (§4.I).
    #[error("unsupported operation")]
    Unsupported,

    /// An error that doesn't fit any other variant.
    #[error("internal error: {0}")]
    Internal(String),
}

/// The registry v2 error envelope, `{"errors": [...]}`.
#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorEntry {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServerError {
    /// Maps this error to its registry v2 error code and HTTP status, per §7.
    fn code_and_status(&self) -> (&'static str, StatusCode) {
        match self {
            ServerError::Core(core) => match core {
                CoreError::NameUnknown(_) | CoreError::SpecNotFound(_) => {
                    ("NAME_UNKNOWN", StatusCode::NOT_FOUND)
                }
                CoreError::ManifestUnknown(_) => ("MANIFEST_UNKNOWN", StatusCode::NOT_FOUND),
                CoreError::BlobUnknown(_) => ("BLOB_UNKNOWN", StatusCode::NOT_FOUND),
                CoreError::Unauthorized => ("UNAUTHORIZED", StatusCode::UNAUTHORIZED),
                CoreError::DigestMismatch { .. } => ("DIGEST_INVALID", StatusCode::BAD_REQUEST),
                CoreError::RangeUnsatisfiable(..) => ("UNKNOWN", StatusCode::RANGE_NOT_SATISFIABLE),
                CoreError::SpecUnavailable(_) => ("DENIED", StatusCode::SERVICE_UNAVAILABLE),
                CoreError::SpecMalformed(_) => ("MANIFEST_INVALID", StatusCode::BAD_GATEWAY),
                CoreError::UpstreamUnavailable(_) => ("UNKNOWN", StatusCode::BAD_GATEWAY),
                _ => ("UNKNOWN", StatusCode::INTERNAL_SERVER_ERROR),
            },
            ServerError::InvalidRange(_) => ("UNKNOWN", StatusCode::RANGE_NOT_SATISFIABLE),
            ServerError::Unsupported => ("UNSUPPORTED", StatusCode::NOT_FOUND),
            ServerError::Handover(_) | ServerError::Internal(_) => {
                ("UNKNOWN", StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (code, status) = self.code_and_status();
        tracing::warn!(error = %self, code, %status, "request failed");

        let envelope = ErrorEnvelope {
            errors: vec![ErrorEntry {
                code,
                message: self.to_string(),
                detail: None,
            }],
        };

        (status, Json(envelope)).into_response()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::Digest;
    use std::str::FromStr;

    #[test]
    fn name_unknown_maps_to_404() {
        let err = ServerError::Core(CoreError::NameUnknown("acme/alice".to_string()));
        assert_eq!(err.code_and_status(), ("NAME_UNKNOWN", StatusCode::NOT_FOUND));
    }

    #[test]
    fn blob_unknown_maps_to_404() {
        let digest = Digest::from_str(&format!("sha256:{}", "0".repeat(64))).unwrap();
        let err = ServerError::Core(CoreError::BlobUnknown(digest));
        assert_eq!(err.code_and_status(), ("BLOB_UNKNOWN", StatusCode::NOT_FOUND));
    }

    #[test]
    fn range_unsatisfiable_maps_to_416() {
        let err = ServerError::Core(CoreError::RangeUnsatisfiable(0, Some(10), 5));
        assert_eq!(
            err.code_and_status(),
            ("UNKNOWN", StatusCode::RANGE_NOT_SATISFIABLE)
        );
    }

    #[test]
    fn spec_unavailable_maps_to_503() {
        let err = ServerError::Core(CoreError::SpecUnavailable("down".to_string()));
        assert_eq!(err.code_and_status(), ("DENIED", StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn into_response_sets_status_and_envelope() {
        let err = ServerError::Core(CoreError::Unauthorized);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
