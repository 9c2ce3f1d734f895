//! Command-line arguments for the `registry-facade` binary, matching the configuration table of
//! §6: every flag falls back to an `RF_*` environment variable via `clap`'s `env` feature before
//! falling back to the defaults in `registry_facade_utils::defaults`.

use std::path::PathBuf;

use clap::Parser;
use registry_facade_server::config::{StaticLayerKind, StaticLayerSpec};
use registry_facade_utils::{defaults, env};

use crate::error::{CliError, CliResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Arguments accepted by the `registry-facade` binary.
#[derive(Debug, Parser)]
#[command(name = "registry-facade", author, version, about)]
pub struct Args {
    /// Host address to listen on.
    #[arg(long, default_value = defaults::DEFAULT_SERVER_HOST)]
    pub host: String,

    /// Port number to listen on.
    #[arg(long, env = env::RF_PORT_ENV_VAR, default_value_t = defaults::DEFAULT_SERVER_PORT)]
    pub port: u16,

    /// URL path prefix inserted before `/v2`.
    #[arg(long, env = env::RF_PREFIX_ENV_VAR, default_value = defaults::DEFAULT_URL_PREFIX)]
    pub prefix: String,

    /// Local blob store root. Defaults to `~/.registry-facade/blobs`.
    #[arg(long, env = env::RF_STORE_ENV_VAR)]
    pub store: Option<PathBuf>,

    /// A statically configured layer source, as `ref:file` or `ref:image`. Repeatable; order is
    /// preserved (§4.C, §4.D).
    #[arg(long = "static-layer", value_name = "ref:type")]
    pub static_layer: Vec<String>,

    /// Endpoint of the remote image-spec RPC, e.g. `https://spec-provider.internal:9443`.
    #[arg(long = "spec-provider-addr", env = env::RF_SPEC_PROVIDER_ADDR_ENV_VAR)]
    pub spec_provider_addr: Option<String>,

    /// CA certificate (PEM) used to verify the spec provider endpoint.
    #[arg(long = "spec-provider-tls-ca")]
    pub spec_provider_tls_ca: Option<PathBuf>,

    /// Client certificate (PEM) presented to the spec provider endpoint.
    #[arg(long = "spec-provider-tls-crt")]
    pub spec_provider_tls_crt: Option<PathBuf>,

    /// Client private key (PEM) presented to the spec provider endpoint.
    #[arg(long = "spec-provider-tls-key")]
    pub spec_provider_tls_key: Option<PathBuf>,

    /// Reject requests lacking an `Authorization` header with 401 + `WWW-Authenticate: Basic`.
    #[arg(long = "require-auth", env = env::RF_REQUIRE_AUTH_ENV_VAR, default_value_t = false)]
    pub require_auth: bool,

    /// TLS certificate (PEM) to serve HTTPS. Requires `--tls-key`.
    #[arg(long = "tls-crt", requires = "tls_key")]
    pub tls_crt: Option<PathBuf>,

    /// TLS private key (PEM) to serve HTTPS. Requires `--tls-crt`.
    #[arg(long = "tls-key", requires = "tls_crt")]
    pub tls_key: Option<PathBuf>,

    /// Enable zero-downtime listener handover (§4.J).
    #[arg(long = "handover", env = env::RF_HANDOVER_ENV_VAR, default_value_t = false)]
    pub handover_enabled: bool,

    /// Directory handover sockets are published under. Defaults to `~/.registry-facade/handover`.
    #[arg(long = "handover-dir", env = env::RF_HANDOVER_DIR_ENV_VAR)]
    pub handover_dir: Option<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Args {
    /// Resolves the blob store root, applying the default under the facade home directory when
    /// `--store` was not given.
    pub fn resolved_store(&self) -> PathBuf {
        self.store
            .clone()
            .unwrap_or_else(|| defaults::DEFAULT_FACADE_HOME.join(defaults::BLOB_STORE_SUBDIR))
    }

    /// Resolves the handover socket directory, applying the default under the facade home
    /// directory when `--handover-dir` was not given.
    pub fn resolved_handover_dir(&self) -> PathBuf {
        self.handover_dir
            .clone()
            .unwrap_or_else(|| defaults::DEFAULT_FACADE_HOME.join("handover"))
    }

    /// The TLS certificate/key pair to serve HTTPS with, if both were given.
    pub fn resolved_tls(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.tls_crt, &self.tls_key) {
            (Some(crt), Some(key)) => Some((crt.clone(), key.clone())),
            _ => None,
        }
    }

    /// Parses every `--static-layer ref:type` entry into a [`StaticLayerSpec`], in order.
    pub fn parse_static_layers(&self) -> CliResult<Vec<StaticLayerSpec>> {
        self.static_layer.iter().map(|raw| parse_static_layer(raw)).collect()
    }
}

fn parse_static_layer(raw: &str) -> CliResult<StaticLayerSpec> {
    let (reference, kind) = raw
        .rsplit_once(':')
        .ok_or_else(|| CliError::InvalidStaticLayer(raw.to_string()))?;

    let kind = match kind {
        "file" => StaticLayerKind::File,
        "image" => StaticLayerKind::Image,
        _ => return Err(CliError::InvalidStaticLayer(raw.to_string())),
    };

    if reference.is_empty() {
        return Err(CliError::InvalidStaticLayer(raw.to_string()));
    }

    Ok(StaticLayerSpec {
        reference: reference.to_string(),
        kind,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_entry() {
        let spec = parse_static_layer("/var/lib/extra.tar.gz:file").unwrap();
        assert_eq!(spec.reference, "/var/lib/extra.tar.gz");
        assert_eq!(spec.kind, StaticLayerKind::File);
    }

    #[test]
    fn parses_image_entry_with_colon_in_reference() {
        let spec = parse_static_layer("docker.io/library/ide:latest:image").unwrap();
        assert_eq!(spec.reference, "docker.io/library/ide:latest");
        assert_eq!(spec.kind, StaticLayerKind::Image);
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(parse_static_layer("foo:blob").is_err());
    }

    #[test]
    fn rejects_missing_type() {
        assert!(parse_static_layer("foo").is_err());
    }
}
