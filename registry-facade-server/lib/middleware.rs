//! Authentication stub for the registry facade.
//!
//! §1 and §9 specify authentication only as a challenge surface, not a verification scheme:
//! "Authentication is a TODO in the source and is specified here only as the challenge
//! surface." [`auth_stub`] therefore only checks for the *presence* of an `Authorization`
//! header when `requireAuth` is configured — it never inspects or validates the header's
//! contents.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::ServerError, state::AppState};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Rejects requests lacking an `Authorization` header with `401 Unauthorized` and a
/// `WWW-Authenticate: Basic` challenge, when `state.get_config().get_require_auth()` is set.
/// A no-op pass-through otherwise.
pub async fn auth_stub(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    if *state.get_config().get_require_auth() && !request.headers().contains_key(header::AUTHORIZATION) {
        return challenge_response();
    }

    next.run(request).await
}

fn challenge_response() -> Response {
    let mut response = ServerError::Core(registry_facade_core::CoreError::Unauthorized).into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
    response
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::Request,
        middleware::from_fn_with_state,
        response::IntoResponse,
        routing::get,
        Router,
    };
    use registry_facade_core::{
        config_modifier::ConfigModifier, layersource::ContentLayerSource,
        specprovider::SpecProviderMap, store::BlobStore, synth::ManifestSynthesizer,
        upstream::UpstreamResolver,
    };
    use oci_client::secrets::RegistryAuth;
    use oci_spec::image::{Os, PlatformBuilder};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn ok_handler() -> impl IntoResponse {
        (StatusCode::OK, "ok")
    }

    async fn test_state(require_auth: bool) -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path()).await.unwrap();
        let config = Arc::new(
            crate::config::Config::new(
                "127.0.0.1".to_string(),
                0,
                "".to_string(),
                dir.path().to_path_buf(),
                vec![],
                None,
                crate::config::SpecProviderTlsPaths::default(),
                require_auth,
                None,
                false,
                dir.path().to_path_buf(),
            )
            .unwrap(),
        );

        let state = AppState::new(
            config,
            SpecProviderMap::new([]),
            UpstreamResolver::new(
                PlatformBuilder::default()
                    .os(Os::Linux)
                    .architecture(oci_spec::image::Arch::from("amd64"))
                    .build()
                    .unwrap(),
            ),
            RegistryAuth::Anonymous,
            vec![Arc::new(ContentLayerSource::new(vec![]))],
            store,
            ManifestSynthesizer::new(ConfigModifier::new(128), 128),
        );

        (state, dir)
    }

    #[tokio::test]
    async fn rejects_missing_header_when_required() {
        let (state, _dir) = test_state(true).await;
        let app = Router::new()
            .route("/", get(ok_handler))
            .layer(from_fn_with_state(state.clone(), auth_stub))
            .with_state(state);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Basic"
        );
    }

    #[tokio::test]
    async fn passes_through_when_header_present() {
        let (state, _dir) = test_state(true).await;
        let app = Router::new()
            .route("/", get(ok_handler))
            .layer(from_fn_with_state(state.clone(), auth_stub))
            .with_state(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(header::AUTHORIZATION, "Basic anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn passes_through_when_auth_not_required() {
        let (state, _dir) = test_state(false).await;
        let app = Router::new()
            .route("/", get(ok_handler))
            .layer(from_fn_with_state(state.clone(), auth_stub))
            .with_state(state);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
