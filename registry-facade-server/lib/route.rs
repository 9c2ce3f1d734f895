//! Router configuration for the registry facade (§4.I).
//!
//! `{name}` in the OCI distribution spec can itself contain slashes (`acme/alice`), which rules
//! out axum's ordinary single-segment path parameters for the whole `/v2/{name}/manifests/{ref}`
//! shape. Following the route-table idiom the pack's own registry-server reference code uses for
//! this exact problem, everything under `/v2/` beyond the bare health check is captured with a
//! single wildcard segment and split back into name/operation/reference by [`handler::dispatch`].

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{any, get},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{handler, middleware::auth_stub, state::AppState};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the facade's router, nested under `state.get_config().get_prefix()`.
pub fn create_router(state: AppState) -> Router {
    let prefix = state.get_config().get_prefix().clone();

    let v2 = Router::new()
        .route("/v2/", get(handler::check))
        .route("/v2/{*tail}", any(handler::dispatch))
        .fallback(handler::unsupported)
        .layer(from_fn_with_state(state.clone(), auth_stub))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    if prefix.is_empty() {
        v2
    } else {
        Router::new().nest(&prefix, v2)
    }
}
