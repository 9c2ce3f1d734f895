//! Image-spec provider (§4.E): maps a `(provider-name, remainder)` pair to an [`ImageSpec`],
//! with a bounded, singleflight-deduplicated cache in front of each provider.

pub mod memory;
pub mod rpc;

pub use memory::{StaticSpecProvider, UniformSpecProvider};
pub use rpc::RpcSpecProvider;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use moka::future::Cache;

use crate::{
    error::CoreError,
    model::ImageSpec,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Resolves a `remainder` name to an [`ImageSpec`] for one named provider.
#[async_trait]
pub trait SpecProvider: Send + Sync {
    /// Resolves `remainder` to its spec. Returns `Err(CoreError::SpecNotFound(_))` if the
    /// provider has no spec under that name.
    async fn get_spec(&self, remainder: &str) -> crate::error::CoreResult<ImageSpec>;
}

/// Maps provider names to providers, following the name-to-implementation resolution style the
/// teacher uses for registry auth providers.
#[derive(Clone, Default)]
pub struct SpecProviderMap {
    providers: Arc<HashMap<String, Arc<dyn SpecProvider>>>,
}

/// Wraps a [`SpecProvider`] with a bounded LRU cache that deduplicates concurrent identical
/// requests (singleflight) via `moka`'s `try_get_with`. Negative results (not-found, unavailable,
/// malformed) are never cached, since `try_get_with` does not insert on `Err`.
pub struct CachedSpecProvider<P> {
    inner: P,
    cache: Cache<String, ImageSpec>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SpecProviderMap {
    /// Builds a provider map from `(name, provider)` pairs.
    pub fn new(providers: impl IntoIterator<Item = (String, Arc<dyn SpecProvider>)>) -> Self {
        Self {
            providers: Arc::new(providers.into_iter().collect()),
        }
    }

    /// Looks up the provider registered under `name`.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn SpecProvider>> {
        self.providers.get(name)
    }
}

impl<P> CachedSpecProvider<P>
where
    P: SpecProvider + 'static,
{
    /// Wraps `inner` with a cache of `max_capacity` entries and no TTL (capacity-evicted only).
    pub fn new(inner: P, max_capacity: u64) -> Self {
        Self {
            inner,
            cache: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    /// Reconstructs an owned [`CoreError`] from a cache-shared `Arc<CoreError>`. `CoreError`
    /// cannot derive `Clone` (it embeds non-`Clone` sources like `std::io::Error`), so on a
    /// cache miss that fails we rebuild a fresh error of the same kind instead of cloning.
    fn reclassify(err: &CoreError) -> CoreError {
        match err {
            CoreError::SpecNotFound(name) => CoreError::SpecNotFound(name.clone()),
            CoreError::SpecUnavailable(name) => CoreError::SpecUnavailable(name.clone()),
            CoreError::SpecMalformed(name) => CoreError::SpecMalformed(name.clone()),
            CoreError::NameUnknown(name) => CoreError::NameUnknown(name.clone()),
            other => CoreError::custom(anyhow::anyhow!("{other}")),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl<P> SpecProvider for CachedSpecProvider<P>
where
    P: SpecProvider + 'static,
{
    async fn get_spec(&self, remainder: &str) -> crate::error::CoreResult<ImageSpec> {
        self.cache
            .try_get_with(remainder.to_string(), self.inner.get_spec(remainder))
            .await
            .map_err(|arc_err| Self::reclassify(&arc_err))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        spec: ImageSpec,
    }

    #[async_trait]
    impl SpecProvider for CountingProvider {
        async fn get_spec(&self, _remainder: &str) -> crate::error::CoreResult<ImageSpec> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.spec.clone())
        }
    }

    fn test_spec() -> ImageSpec {
        use oci_client::Reference;
        ImageSpec::new(
            "docker.io/library/base:1.0".parse::<Reference>().unwrap(),
            None,
            vec![],
            vec![],
            None,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn concurrent_identical_requests_singleflight() {
        let provider = CachedSpecProvider::new(
            CountingProvider {
                calls: AtomicUsize::new(0),
                spec: test_spec(),
            },
            128,
        );
        let provider = Arc::new(provider);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let provider = provider.clone();
                tokio::spawn(async move { provider.get_spec("acme/alice").await.unwrap() })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 1);
    }

    struct FailingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpecProvider for FailingProvider {
        async fn get_spec(&self, remainder: &str) -> crate::error::CoreResult<ImageSpec> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::SpecNotFound(remainder.to_string()))
        }
    }

    #[tokio::test]
    async fn not_found_results_are_never_cached() {
        let provider = CachedSpecProvider::new(
            FailingProvider {
                calls: AtomicUsize::new(0),
            },
            128,
        );

        assert!(provider.get_spec("missing").await.is_err());
        assert!(provider.get_spec("missing").await.is_err());
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 2);
    }
}
