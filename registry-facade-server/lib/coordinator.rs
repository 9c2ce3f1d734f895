//! Process coordinator (§4.K): wires (A)–(J) into a running server, owns the listen socket —
//! acquired fresh or recovered from a predecessor via handover (§4.J) — and owns signal handling
//! for graceful shutdown and handover hand-off.
//!
//! Grounded on `msbserver.rs`'s binary-entrypoint shape and on
//! `microsandbox-server::management`'s `tokio::signal::unix` SIGTERM/SIGINT handling, generalized
//! from a child-process supervisor into an in-process listener lifecycle.

use std::{path::Path, time::Duration};

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ServerError, ServerResult},
    route,
    state::AppState,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Acquires the listener this process will serve on: if handover is enabled, first tries to
/// recover one from a predecessor publishing under `state.get_config().get_handover_dir()`,
/// falling back to binding a fresh listener on `registry_facade_handover::HandoverError::NoDonor`
/// or any other recovery failure (§4.J step "the recipient MUST fall back").
pub async fn acquire_listener(state: &AppState) -> ServerResult<TcpListener> {
    let config = state.get_config();

    if *config.get_handover_enabled() {
        let timeout = Duration::from_secs(registry_facade_utils::defaults::DEFAULT_HANDOVER_TIMEOUT_SECS);
        match registry_facade_handover::recover(config.get_handover_dir(), timeout).await {
            Ok(listener) => {
                tracing::info!("recovered listener via handover");
                return Ok(listener);
            }
            Err(err) => {
                tracing::info!(error = %err, "no listener recovered via handover, binding fresh");
            }
        }
    }

    let listener = TcpListener::bind(config.get_addr())
        .await
        .map_err(|err| ServerError::Internal(format!("failed to bind {}: {err}", config.get_addr())))?;
    Ok(listener)
}

/// Serves `state`'s router on `listener` until a shutdown signal arrives (§4.K, §5).
///
/// On SIGINT, shuts down directly with no successor. On SIGTERM, if handover is enabled,
/// attempts to publish a donor socket and hand the listener off to a waiting recipient before
/// beginning graceful shutdown; if handover is disabled, or the hand-off itself fails, falls
/// back to the same direct graceful shutdown as SIGINT.
///
/// When `config.tls` is set, the listener is served over HTTPS via `axum-server`'s rustls
/// acceptor instead of `axum::serve`; everything else (handover, signal handling) is identical
/// between the two paths.
pub async fn run(state: AppState, listener: TcpListener) -> ServerResult<()> {
    let config = state.get_config().clone();
    let local_addr = listener
        .local_addr()
        .map_err(|err| ServerError::Internal(err.to_string()))?;

    // The donor side of a hand-off needs its own handle on the same listening socket so it can
    // read the FD out of it (§4.J step 3) while the handle actually driving Accept stays with
    // whichever server loop below is running. `try_clone` dup's the underlying file descriptor;
    // both handles refer to the same open file description, so neither Accept-ing nor closing
    // one affects the other's validity.
    let std_listener = listener
        .into_std()
        .map_err(|err| ServerError::Internal(err.to_string()))?;
    let donor_std = std_listener
        .try_clone()
        .map_err(|err| ServerError::Internal(err.to_string()))?;
    let donor_listener = TcpListener::from_std(donor_std)
        .map_err(|err| ServerError::Internal(err.to_string()))?;

    let app = route::create_router(state);

    let shutdown = CancellationToken::new();
    let shutdown_for_signals = shutdown.clone();
    let handover_enabled = *config.get_handover_enabled();
    let handover_dir = config.get_handover_dir().clone();

    let signal_task = tokio::spawn(async move {
        wait_for_shutdown_signal(handover_enabled, &handover_dir, &donor_listener).await;
        shutdown_for_signals.cancel();
    });

    tracing::info!(addr = %local_addr, "serving registry facade");
    let result = match config.get_tls() {
        Some((crt, key)) => serve_tls(std_listener, app, crt, key, shutdown).await,
        None => serve_plain(std_listener, app, shutdown).await,
    };

    signal_task.abort();
    result
}

/// Serves `app` over plain HTTP with `axum::serve`, stopping once `shutdown` is cancelled.
async fn serve_plain(
    std_listener: std::net::TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> ServerResult<()> {
    let listener =
        TcpListener::from_std(std_listener).map_err(|err| ServerError::Internal(err.to_string()))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|err| ServerError::Internal(err.to_string()))
}

/// Serves `app` over HTTPS via `axum-server`'s rustls acceptor, loading `crt`/`key` as PEM.
///
/// `axum-server::Handle::graceful_shutdown` plays the same role `axum::serve`'s
/// `with_graceful_shutdown` does in [`serve_plain`]: in-flight requests finish, no new
/// connections are accepted once triggered.
async fn serve_tls(
    std_listener: std::net::TcpListener,
    app: Router,
    crt: &Path,
    key: &Path,
    shutdown: CancellationToken,
) -> ServerResult<()> {
    let tls_config = RustlsConfig::from_pem_file(crt, key)
        .await
        .map_err(|err| ServerError::Internal(format!("failed to load tls material: {err}")))?;

    std_listener
        .set_nonblocking(true)
        .map_err(|err| ServerError::Internal(err.to_string()))?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(
            registry_facade_utils::defaults::DEFAULT_HANDOVER_TIMEOUT_SECS,
        )));
    });

    axum_server::from_tcp_rustls(std_listener, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|err| ServerError::Internal(err.to_string()))
}

/// Waits for SIGTERM or SIGINT. On SIGTERM with handover enabled, attempts a hand-off first; any
/// failure falls through to a plain return, which the caller treats identically to SIGINT.
async fn wait_for_shutdown_signal(
    handover_enabled: bool,
    handover_dir: &std::path::Path,
    donor_listener: &TcpListener,
) {
    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        tracing::warn!("failed to install SIGTERM handler");
        return;
    };
    let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
        tracing::warn!("failed to install SIGINT handler");
        return;
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM");
            if handover_enabled {
                attempt_hand_off(handover_dir, donor_listener).await;
            }
        }
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, shutting down with no successor");
        }
    }
}

async fn attempt_hand_off(handover_dir: &std::path::Path, listener: &TcpListener) {
    let timeout = Duration::from_secs(registry_facade_utils::defaults::DEFAULT_HANDOVER_TIMEOUT_SECS);
    let donor = match registry_facade_handover::Donor::publish(handover_dir).await {
        Ok(donor) => donor,
        Err(err) => {
            tracing::warn!(error = %err, "failed to publish handover socket, shutting down directly");
            return;
        }
    };

    match donor.hand_off(listener, timeout).await {
        Ok(()) => tracing::info!("handed off listener to successor"),
        Err(err) => tracing::warn!(error = %err, "handover failed, shutting down directly"),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use oci_client::secrets::RegistryAuth;
    use oci_spec::image::{Os, PlatformBuilder};
    use registry_facade_core::{
        config_modifier::ConfigModifier, layersource::ContentLayerSource, specprovider::SpecProviderMap,
        store::BlobStore, synth::ManifestSynthesizer, upstream::UpstreamResolver,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn test_state(handover_enabled: bool) -> (AppState, TempDir) {
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
                false,
                None,
                handover_enabled,
                dir.path().join("handover"),
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
    async fn acquires_fresh_listener_when_handover_disabled() {
        let (state, _dir) = test_state(false).await;
        let listener = acquire_listener(&state).await.unwrap();
        assert!(listener.local_addr().is_ok());
    }

    #[tokio::test]
    async fn falls_back_to_fresh_listener_when_no_donor_present() {
        let (state, _dir) = test_state(true).await;
        let listener = acquire_listener(&state).await.unwrap();
        assert!(listener.local_addr().is_ok());
    }
}
