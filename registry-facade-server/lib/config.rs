//! Configuration module for the registry facade server (§6).
//!
//! Options are resolved by the caller (CLI flags winning over `RF_*` environment variables,
//! winning over the defaults in `registry_facade_utils::defaults`) before reaching [`Config::new`],
//! which only validates and normalizes the result: parsing the listen address, applying the
//! debug-only `RF_ROOT_PREFIX` tunnel to every on-disk path, and rejecting a `tls` pair that is
//! only half-specified.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use getset::Getters;
use registry_facade_utils::env;

use crate::error::{ServerError, ServerResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What kind of thing a `--static-layer` entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticLayerKind {
    /// A single local gzip'd tar layer file.
    File,
    /// A whole upstream image, resolved once at startup.
    Image,
}

/// One `ref:type` pair from `--static-layer` (§6).
#[derive(Debug, Clone)]
pub struct StaticLayerSpec {
    /// The file path or image reference, depending on `kind`.
    pub reference: String,
    /// Whether `reference` names a file or an image.
    pub kind: StaticLayerKind,
}

/// PEM file paths for mTLS material used to reach the remote spec provider.
#[derive(Debug, Clone, Default)]
pub struct SpecProviderTlsPaths {
    /// Path to the CA certificate.
    pub ca: Option<PathBuf>,
    /// Path to the client certificate.
    pub crt: Option<PathBuf>,
    /// Path to the client private key.
    pub key: Option<PathBuf>,
}

/// Configuration for the registry facade server, validated and normalized from raw CLI/env
/// input (§6).
#[derive(Debug, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Config {
    /// The address the facade listens on.
    addr: SocketAddr,

    /// The URL path prefix inserted before `/v2`.
    prefix: String,

    /// The local blob store root.
    store: PathBuf,

    /// Ordered list of statically configured layer sources.
    static_layer: Vec<StaticLayerSpec>,

    /// The remote spec provider's RPC endpoint, if configured.
    spec_provider_addr: Option<String>,

    /// mTLS material for the remote spec provider connection.
    spec_provider_tls: SpecProviderTlsPaths,

    /// Whether to reject requests lacking an `Authorization` header (§9 auth stub).
    require_auth: bool,

    /// TLS certificate/key paths for serving HTTPS, if configured.
    tls: Option<(PathBuf, PathBuf)>,

    /// Whether listener handover (§4.J) is enabled.
    handover_enabled: bool,

    /// Directory handover sockets are published under.
    handover_dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Config {
    /// Builds a validated configuration from resolved CLI/env input.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: String,
        port: u16,
        prefix: String,
        store: PathBuf,
        static_layer: Vec<StaticLayerSpec>,
        spec_provider_addr: Option<String>,
        spec_provider_tls: SpecProviderTlsPaths,
        require_auth: bool,
        tls: Option<(PathBuf, PathBuf)>,
        handover_enabled: bool,
        handover_dir: PathBuf,
    ) -> ServerResult<Self> {
        let host_ip: IpAddr = host
            .parse()
            .map_err(|_| ServerError::Internal(format!("invalid host address: {host}")))?;
        let addr = SocketAddr::new(host_ip, port);

        if tls
            .as_ref()
            .is_some_and(|(crt, key)| crt.as_os_str().is_empty() || key.as_os_str().is_empty())
        {
            return Err(ServerError::Internal(
                "tls requires both --tls-crt and --tls-key".to_string(),
            ));
        }

        Ok(Self {
            addr,
            prefix,
            store: env::apply_root_prefix(store),
            static_layer,
            spec_provider_addr,
            spec_provider_tls: SpecProviderTlsPaths {
                ca: spec_provider_tls.ca.map(env::apply_root_prefix),
                crt: spec_provider_tls.crt.map(env::apply_root_prefix),
                key: spec_provider_tls.key.map(env::apply_root_prefix),
            },
            require_auth,
            tls: tls.map(|(crt, key)| (env::apply_root_prefix(crt), env::apply_root_prefix(key))),
            handover_enabled,
            handover_dir: env::apply_root_prefix(handover_dir),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> (String, u16, String, PathBuf) {
        (
            "127.0.0.1".to_string(),
            5000,
            "".to_string(),
            PathBuf::from("/tmp/store"),
        )
    }

    #[test]
    fn builds_valid_config() {
        let (host, port, prefix, store) = base_args();
        let config = Config::new(
            host,
            port,
            prefix,
            store,
            vec![],
            None,
            SpecProviderTlsPaths::default(),
            false,
            None,
            false,
            PathBuf::from("/tmp/handover"),
        )
        .unwrap();

        assert_eq!(config.get_addr().port(), 5000);
    }

    #[test]
    fn rejects_invalid_host() {
        let (_, port, prefix, store) = base_args();
        let err = Config::new(
            "not-an-ip".to_string(),
            port,
            prefix,
            store,
            vec![],
            None,
            SpecProviderTlsPaths::default(),
            false,
            None,
            false,
            PathBuf::from("/tmp/handover"),
        )
        .unwrap_err();

        assert!(matches!(err, ServerError::Internal(_)));
    }

    #[test]
    fn rejects_half_specified_tls() {
        let (host, port, prefix, store) = base_args();
        let err = Config::new(
            host,
            port,
            prefix,
            store,
            vec![],
            None,
            SpecProviderTlsPaths::default(),
            false,
            Some((PathBuf::new(), PathBuf::from("/tmp/key.pem"))),
            false,
            PathBuf::from("/tmp/handover"),
        )
        .unwrap_err();

        assert!(matches!(err, ServerError::Internal(_)));
    }
}
