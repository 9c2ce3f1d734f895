//! Entry point for the `registry-facade` binary (§4.K, §6).
//!
//! Mirrors the teacher's `msbserver.rs` shape: init tracing, parse args, build configuration,
//! assemble the synthesis pipeline (A)-(H), and hand the result to the coordinator (§4.K) to
//! acquire a listener (fresh or recovered via handover) and serve until shutdown.

use std::sync::Arc;

use clap::Parser;
use oci_client::secrets::RegistryAuth;
use oci_spec::image::{Arch, Os, PlatformBuilder};
use registry_facade_cli::{Args, CliResult};
use registry_facade_core::{
    config_modifier::ConfigModifier,
    layersource::{FileLayerSource, LayerSource, StaticImageSource},
    model::ImageSpec,
    specprovider::{CachedSpecProvider, RpcSpecProvider, SpecProviderMap, UniformSpecProvider},
    store::BlobStore,
    synth::ManifestSynthesizer,
    upstream::{resolve_registry_auth, UpstreamResolver},
};
use registry_facade_proto::{SpecRpcChannel, TlsMaterial};
use registry_facade_server::{config::Config, coordinator, state::AppState};
use registry_facade_utils::defaults;

//--------------------------------------------------------------------------------------------------
// Functions: Main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> CliResult<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let config = Arc::new(Config::new(
        args.host.clone(),
        args.port,
        args.prefix.clone(),
        args.resolved_store(),
        args.parse_static_layers()?,
        args.spec_provider_addr.clone(),
        registry_facade_server::config::SpecProviderTlsPaths {
            ca: args.spec_provider_tls_ca.clone(),
            crt: args.spec_provider_tls_crt.clone(),
            key: args.spec_provider_tls_key.clone(),
        },
        args.require_auth,
        args.resolved_tls(),
        args.handover_enabled,
        args.resolved_handover_dir(),
    )?);

    let resolver = UpstreamResolver::new(
        PlatformBuilder::default()
            .os(Os::Linux)
            .architecture(Arch::from("amd64"))
            .build()
            .expect("static platform always builds"),
    );
    let auth = resolve_registry_auth()?;

    let store = BlobStore::new(config.get_store().clone()).await?;

    let static_sources = build_static_sources(&config, &resolver, auth.clone()).await?;
    let static_base_ref = first_static_image_ref(&config).unwrap_or(defaults::DEFAULT_STATIC_BASE_REF);
    let uniform_spec = ImageSpec::new(parse_reference(static_base_ref)?, None, vec![], vec![], None, None, None);

    let mut providers: Vec<(String, Arc<dyn registry_facade_core::specprovider::SpecProvider>)> =
        vec![("static".to_string(), Arc::new(UniformSpecProvider::new(uniform_spec)))];

    if let Some(addr) = config.get_spec_provider_addr() {
        let tls = spec_provider_tls(&config).await?;
        let channel = SpecRpcChannel::connect(addr, tls).await?;
        let provider = CachedSpecProvider::new(RpcSpecProvider::new(channel), defaults::DEFAULT_SPEC_CACHE_CAPACITY);
        providers.push(("remote".to_string(), Arc::new(provider)));
    }

    let state = AppState::new(
        config.clone(),
        SpecProviderMap::new(providers),
        resolver,
        auth,
        static_sources,
        store,
        ManifestSynthesizer::new(
            ConfigModifier::new(defaults::DEFAULT_DIFF_ID_CACHE_CAPACITY),
            defaults::DEFAULT_MANIFEST_CACHE_CAPACITY,
        ),
    );

    let listener = coordinator::acquire_listener(&state).await?;
    tracing::info!(addr = %config.get_addr(), "registry facade ready");
    coordinator::run(state, listener).await?;

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Resolves every `--static-layer` entry into its layer source, in declared order (§4.C, §4.D):
/// `file` entries are hashed off disk, `image` entries are resolved against upstream once.
async fn build_static_sources(
    config: &Config,
    resolver: &UpstreamResolver,
    auth: RegistryAuth,
) -> CliResult<Vec<Arc<dyn LayerSource>>> {
    let mut sources: Vec<Arc<dyn LayerSource>> = Vec::with_capacity(config.get_static_layer().len());

    for entry in config.get_static_layer() {
        match entry.kind {
            registry_facade_server::config::StaticLayerKind::File => {
                let source = FileLayerSource::open(entry.reference.clone(), defaults::OCI_LAYER_MEDIA_TYPE).await?;
                sources.push(Arc::new(source));
            }
            registry_facade_server::config::StaticLayerKind::Image => {
                let reference = parse_reference(&entry.reference)?;
                let source = StaticImageSource::resolve(&reference, resolver, auth.clone()).await?;
                sources.push(Arc::new(source));
            }
        }
    }

    Ok(sources)
}

/// Parses a reference string, wrapping the underlying parse error so it fits [`CliError`]
/// without depending on `oci_client`'s own error type.
fn parse_reference(raw: &str) -> CliResult<oci_client::Reference> {
    raw.parse()
        .map_err(|_| registry_facade_cli::CliError::InvalidReference(raw.to_string()))
}

/// The reference of the first configured `image`-typed `--static-layer`, if any, used as the
/// `static` provider's base image when the operator hasn't pinned one explicitly.
fn first_static_image_ref(config: &Config) -> Option<&str> {
    config
        .get_static_layer()
        .iter()
        .find(|entry| matches!(entry.kind, registry_facade_server::config::StaticLayerKind::Image))
        .map(|entry| entry.reference.as_str())
}

/// Loads the mTLS material for the remote spec provider connection, if any path was given.
async fn spec_provider_tls(config: &Config) -> CliResult<Option<TlsMaterial>> {
    let paths = config.get_spec_provider_tls();
    if paths.ca.is_none() && paths.crt.is_none() && paths.key.is_none() {
        return Ok(None);
    }

    let ca = match &paths.ca {
        Some(path) => Some(tokio::fs::read(path).await?),
        None => None,
    };
    let cert = match &paths.crt {
        Some(path) => Some(tokio::fs::read(path).await?),
        None => None,
    };
    let key = match &paths.key {
        Some(path) => Some(tokio::fs::read(path).await?),
        None => None,
    };

    Ok(Some(TlsMaterial { ca, cert, key }))
}
