//! Application state for the registry facade server.
//!
//! Holds everything a request handler needs to resolve a spec, compose its layer sources (§4.D),
//! and route manifests/blobs: the provider map (E), the upstream resolver and resolved credentials
//! (B), the operator-configured static layer sources (C, resolved once at startup), the blob
//! store (A), and the manifest synthesizer (G).

use std::sync::Arc;

use getset::Getters;
use oci_client::secrets::RegistryAuth;
use registry_facade_core::{
    layersource::{CompositeLayerSource, ContentLayerEntry, LayerSource, Role, SpecImageSource},
    model::ImageSpec,
    specprovider::SpecProviderMap,
    store::BlobStore,
    synth::ManifestSynthesizer,
    upstream::UpstreamResolver,
};

use crate::config::Config;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Shared application state, cloned cheaply (everything inside is an `Arc` or already `Clone`)
/// into every request handler.
#[derive(Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct AppState {
    /// The application configuration.
    config: Arc<Config>,

    /// Maps provider names to image-spec providers (§4.E).
    spec_providers: SpecProviderMap,

    /// Produces per-request upstream fetchers (§4.B).
    resolver: UpstreamResolver,

    /// Credentials used for every upstream fetch.
    auth: RegistryAuth,

    /// Operator-configured static layer sources (§4.C), resolved once at startup and shared by
    /// every composite built for an incoming request.
    static_sources: Vec<Arc<dyn LayerSource>>,

    /// The local blob store (§4.A).
    store: BlobStore,

    /// The manifest/config synthesizer (§4.G).
    synthesizer: ManifestSynthesizer,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AppState {
    /// Creates a new application state instance.
    pub fn new(
        config: Arc<Config>,
        spec_providers: SpecProviderMap,
        resolver: UpstreamResolver,
        auth: RegistryAuth,
        static_sources: Vec<Arc<dyn LayerSource>>,
        store: BlobStore,
        synthesizer: ManifestSynthesizer,
    ) -> Self {
        Self {
            config,
            spec_providers,
            resolver,
            auth,
            static_sources,
            store,
            synthesizer,
        }
    }

    /// Builds the per-request composite layer source for `spec` (§4.D): the spec's base image,
    /// its IDE image if any, every operator-configured static source, and finally the spec's
    /// dynamic content layers — in that declared order, since later children never override an
    /// earlier one's claim on a shared digest.
    pub fn build_composite(&self, spec: &ImageSpec) -> CompositeLayerSource {
        let mut children: Vec<Arc<dyn LayerSource>> = Vec::with_capacity(3 + self.static_sources.len());

        children.push(Arc::new(SpecImageSource::new(
            Role::Base,
            spec.clone(),
            self.resolver.clone(),
            self.auth.clone(),
        )));

        if spec.get_ide_ref().is_some() {
            children.push(Arc::new(SpecImageSource::new(
                Role::Ide,
                spec.clone(),
                self.resolver.clone(),
                self.auth.clone(),
            )));
        }

        children.extend(self.static_sources.iter().cloned());

        let content_layers: Vec<ContentLayerEntry> = spec.get_content_layer().clone();
        children.push(Arc::new(
            registry_facade_core::layersource::ContentLayerSource::new(content_layers),
        ));

        CompositeLayerSource::new(children)
    }
}
