//! Upstream registry resolver (§4.B).
//!
//! Generalizes the teacher's `Registry` client into a factory: each call to
//! [`UpstreamResolver::fetcher_for`] produces a fresh [`oci_client::Client`] so concurrent
//! pulls never share cookies, auth state, or redirect history. [`UpstreamResolver`] additionally
//! caches resolved whole-image envelopes by reference (§3 Lifecycles, §4.G) so that repeated
//! synthesis of the same base/IDE image — including fingerprint computation itself, which must
//! resolve the base envelope before it can even look up the manifest cache — never re-fetches
//! an already-resolved image.

use std::{future::Future, time::SystemTime};

use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use moka::future::Cache;
use oci_client::{
    Client as OciClient,
    Reference,
    client::{BlobResponse, ClientConfig as OciClientConfig, Config as OciConfig, LayerDescriptor},
    config::ConfigFile as OciConfigFile,
    manifest::OciImageManifest,
    secrets::RegistryAuth,
};
use oci_spec::image::{Digest, Platform};
use reqwest_retry::{RetryDecision, RetryPolicy, policies::ExponentialBackoff};

use registry_facade_utils::{defaults, env};

use crate::{
    error::{CoreError, CoreResult},
    layersource::ImageEnvelope,
    model::Descriptor,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Maximum retry attempts for a transient upstream failure (§7: "bounded exponential backoff,
/// maximum 3 attempts"), matching the teacher's `ghcr.rs::Ghcr::new` policy.
const MAX_UPSTREAM_RETRIES: u32 = 3;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A factory producing per-request [`Fetcher`]s against upstream registries, and the shared
/// cache of resolved whole-image envelopes those fetchers populate.
#[derive(Clone)]
pub struct UpstreamResolver {
    platform: Platform,
    envelope_cache: Cache<String, ImageEnvelope>,
}

/// A fetcher bound to one upstream reference, able to retrieve its manifest/config and any of
/// its blobs.
pub struct Fetcher {
    client: OciClient,
    auth: RegistryAuth,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl UpstreamResolver {
    /// Creates a new resolver targeting the given platform (OS/architecture) for multi-arch
    /// image indexes.
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            envelope_cache: Cache::builder()
                .max_capacity(defaults::DEFAULT_IMAGE_ENVELOPE_CACHE_CAPACITY)
                .build(),
        }
    }

    /// Produces a fresh fetcher for the given reference and credentials.
    pub fn fetcher_for(&self, auth: RegistryAuth) -> Fetcher {
        let platform = self.platform.clone();
        let config = OciClientConfig {
            platform_resolver: Some(Box::new(move |manifests| {
                manifests
                    .iter()
                    .find(|m| {
                        m.platform.as_ref().is_some_and(|p| {
                            p.os == *platform.os() && p.architecture == *platform.architecture()
                        })
                    })
                    .map(|m| m.digest.clone())
            })),
            ..Default::default()
        };

        Fetcher {
            client: OciClient::new(config),
            auth,
        }
    }

    /// Resolves `reference` to its whole-image envelope, fetching its manifest and config from
    /// upstream at most once regardless of how many times — or from how many independent
    /// [`crate::layersource::SpecImageSource`] instances — it is asked for (§4.G, §8 property 6).
    ///
    /// Concurrent callers for the same reference share one in-flight fetch (`moka`'s
    /// singleflight); the result is cached with no TTL until capacity pressure evicts it, the
    /// same discipline as the image-spec cache (§4.E).
    pub async fn resolve_envelope(&self, reference: &Reference, auth: RegistryAuth) -> CoreResult<ImageEnvelope> {
        let key = reference.whole();
        let fetcher = self.fetcher_for(auth);
        let reference = reference.clone();

        self.envelope_cache
            .try_get_with(key, async move {
                let (resolved_digest, manifest, raw_config_bytes, _config) =
                    fetcher.fetch_manifest_and_config(&reference).await?;

                let config = Descriptor::from_oci(&manifest.config)?;
                let layers = manifest
                    .layers
                    .iter()
                    .map(Descriptor::from_oci)
                    .collect::<CoreResult<Vec<_>>>()?;

                Ok(ImageEnvelope {
                    resolved_digest,
                    config,
                    config_bytes: Bytes::from(raw_config_bytes),
                    layers,
                })
            })
            .await
            .map_err(|arc_err| CoreError::from_cached(&arc_err))
    }
}

impl Fetcher {
    /// Fetches a manifest and its config for the given reference. Returns the resolved
    /// manifest digest, the manifest, the config's raw JSON bytes (as served, needed verbatim
    /// by the config modifier), and the parsed config.
    ///
    /// Retries transient failures (5xx, connection resets) with bounded exponential backoff,
    /// up to [`MAX_UPSTREAM_RETRIES`] attempts (§7); application-level errors are never retried.
    pub async fn fetch_manifest_and_config(
        &self,
        reference: &Reference,
    ) -> CoreResult<(Digest, OciImageManifest, Vec<u8>, OciConfigFile)> {
        with_retry(|| async {
            let (manifest, manifest_digest, config) = self
                .client
                .pull_manifest_and_config(reference, &self.auth)
                .await?;

            let manifest_digest: Digest = manifest_digest.parse().map_err(|_| {
                CoreError::custom(anyhow::anyhow!(
                    "upstream returned an invalid manifest digest: {manifest_digest}"
                ))
            })?;

            let raw_config_bytes = config.as_bytes().to_vec();
            let config = OciConfig::oci_v1(raw_config_bytes.clone(), manifest.annotations.clone());
            let config = OciConfigFile::try_from(config)?;
            Ok((manifest_digest, manifest, raw_config_bytes, config))
        })
        .await
    }

    /// Fetches a byte range of a blob belonging to the given reference as a stream.
    ///
    /// `offset` is the position in the blob to resume from (0 reads from the start); `length`
    /// is the number of bytes to fetch, or `None` to read to the end. Establishing the stream
    /// is retried on transient failure the same as [`Self::fetch_manifest_and_config`]; once
    /// streaming has started, a mid-stream failure is surfaced to the caller rather than
    /// retried (§7 applies retries to the fetch itself, not to already-flowing bytes).
    pub async fn fetch_digest_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        offset: u64,
        length: Option<u64>,
    ) -> CoreResult<BoxStream<'static, CoreResult<Bytes>>> {
        tracing::info!(
            "fetching blob: {digest} {offset}-{}",
            length.map(|l| l.to_string()).unwrap_or_else(|| "end".to_string())
        );

        let layer = LayerDescriptor {
            digest: digest.as_ref(),
            urls: &None,
        };

        let stream = with_retry(|| async {
            self.client
                .pull_blob_stream_partial(reference, &layer, offset, length)
                .await
                .map_err(CoreError::from)
        })
        .await?;

        let stream = match stream {
            BlobResponse::Full(s) => s,
            BlobResponse::Partial(s) => s,
        };

        Ok(stream.stream.map(|r| r.map_err(Into::into)).boxed())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs `operation` with bounded exponential backoff retry on transient failure, mirroring the
/// teacher's `Ghcr::new` policy (`ExponentialBackoff::builder().build_with_max_retries(3)`)
/// adapted from `reqwest-middleware`'s client-level retry to a call-level retry, since
/// `oci_client::Client` owns its HTTP client internally and does not accept middleware.
async fn with_retry<T, F, Fut>(mut operation: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let policy = ExponentialBackoff::builder().build_with_max_retries(MAX_UPSTREAM_RETRIES);
    let start = SystemTime::now();
    let mut past_retries = 0u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => match policy.should_retry(start, past_retries) {
                RetryDecision::Retry { execute_after } => {
                    if let Ok(delay) = execute_after.duration_since(SystemTime::now()) {
                        tokio::time::sleep(delay).await;
                    }
                    past_retries += 1;
                }
                RetryDecision::DoNotRetry => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}

/// Classifies an error as transient per §7: 5xx responses and connection resets. Everything
/// else (auth failures, malformed references, 4xx) is an application-level error and is never
/// retried.
fn is_transient(err: &CoreError) -> bool {
    match err {
        CoreError::Reqwest(e) => is_transient_reqwest(e),
        CoreError::OciDistribution(e) => is_transient_oci(e),
        CoreError::IoError(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

fn is_transient_reqwest(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.status().is_some_and(|status| status.is_server_error())
}

fn is_transient_oci(err: &oci_client::errors::OciDistributionError) -> bool {
    use oci_client::errors::OciDistributionError as E;
    match err {
        E::ServerError { code, .. } => *code >= 500,
        E::ReqwestError(inner) => is_transient_reqwest(inner),
        _ => false,
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves registry auth for a reference from environment-supplied credentials only.
///
/// Priority: bearer token, then basic username/password, then anonymous. Unlike the teacher's
/// `resolve_registry_auth`, this facade has no interactive login step and never consults OS
/// credential storage — upstream credentials arrive from the surrounding coordinator via
/// environment variables (§4.B).
pub fn resolve_registry_auth() -> CoreResult<RegistryAuth> {
    let token = env::get_registry_token();
    let username = env::get_registry_username();
    let password = env::get_registry_password();

    if token.is_some() && (username.is_some() || password.is_some()) {
        return Err(crate::error::CoreError::custom(anyhow::anyhow!(
            "registry token cannot be combined with username/password"
        )));
    }

    if let Some(token) = token {
        return Ok(RegistryAuth::Bearer(token));
    }

    match (username, password) {
        (Some(username), Some(password)) => Ok(RegistryAuth::Basic(username, password)),
        (Some(_), None) | (None, Some(_)) => {
            tracing::warn!(
                "registry credentials provided via env are incomplete; falling back to anonymous"
            );
            Ok(RegistryAuth::Anonymous)
        }
        (None, None) => Ok(RegistryAuth::Anonymous),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        key: &'static str,
        prev: Option<std::ffi::OsString>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: impl Into<std::ffi::OsString>) -> Self {
            let prev = std::env::var_os(key);
            unsafe { std::env::set_var(key, value.into()) };
            Self { key, prev }
        }

        fn remove(key: &'static str) -> Self {
            let prev = std::env::var_os(key);
            unsafe { std::env::remove_var(key) };
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match self.prev.take() {
                Some(value) => unsafe { std::env::set_var(self.key, value) },
                None => unsafe { std::env::remove_var(self.key) },
            }
        }
    }

    #[test]
    fn resolve_registry_auth_prefers_token() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _token = EnvGuard::set(env::RF_REGISTRY_TOKEN_ENV_VAR, "abc");
        let _user = EnvGuard::remove(env::RF_REGISTRY_USERNAME_ENV_VAR);
        let _pass = EnvGuard::remove(env::RF_REGISTRY_PASSWORD_ENV_VAR);

        let auth = resolve_registry_auth().unwrap();
        assert!(matches!(auth, RegistryAuth::Bearer(t) if t == "abc"));
    }

    #[test]
    fn resolve_registry_auth_uses_basic() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _token = EnvGuard::remove(env::RF_REGISTRY_TOKEN_ENV_VAR);
        let _user = EnvGuard::set(env::RF_REGISTRY_USERNAME_ENV_VAR, "u");
        let _pass = EnvGuard::set(env::RF_REGISTRY_PASSWORD_ENV_VAR, "p");

        let auth = resolve_registry_auth().unwrap();
        assert!(matches!(auth, RegistryAuth::Basic(u, p) if u == "u" && p == "p"));
    }

    #[test]
    fn resolve_registry_auth_defaults_anonymous() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _token = EnvGuard::remove(env::RF_REGISTRY_TOKEN_ENV_VAR);
        let _user = EnvGuard::remove(env::RF_REGISTRY_USERNAME_ENV_VAR);
        let _pass = EnvGuard::remove(env::RF_REGISTRY_PASSWORD_ENV_VAR);

        let auth = resolve_registry_auth().unwrap();
        assert!(matches!(auth, RegistryAuth::Anonymous));
    }

    #[test]
    fn resolve_registry_auth_rejects_token_and_basic_together() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _token = EnvGuard::set(env::RF_REGISTRY_TOKEN_ENV_VAR, "abc");
        let _user = EnvGuard::set(env::RF_REGISTRY_USERNAME_ENV_VAR, "u");
        let _pass = EnvGuard::set(env::RF_REGISTRY_PASSWORD_ENV_VAR, "p");

        assert!(resolve_registry_auth().is_err());
    }
}
