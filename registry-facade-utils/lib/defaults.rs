//! Default values and constants used throughout the registry-facade project.

use std::{net::IpAddr, path::PathBuf, sync::LazyLock};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default host address the facade listens on.
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";

/// The default port the facade listens on.
pub const DEFAULT_SERVER_PORT: u16 = 5000;

/// The default URL path prefix inserted before `/v2`.
pub const DEFAULT_URL_PREFIX: &str = "";

/// The default directory name for the on-disk blob store, relative to the facade's home.
pub const BLOB_STORE_SUBDIR: &str = "blobs";

/// The subdirectory of the blob store used for staged (not-yet-committed) writes.
pub const BLOB_STORE_INGEST_SUBDIR: &str = "ingest";

/// The default capacity of the image-spec LRU cache (§3 Lifecycles).
pub const DEFAULT_SPEC_CACHE_CAPACITY: u64 = 128;

/// The default capacity of the synthesized manifest/config LRU cache.
pub const DEFAULT_MANIFEST_CACHE_CAPACITY: u64 = 256;

/// The default capacity of the resolved-image-envelope LRU cache shared by every
/// `SpecImageSource`/`StaticImageSource` instance resolving through the same `UpstreamResolver`.
pub const DEFAULT_IMAGE_ENVELOPE_CACHE_CAPACITY: u64 = 256;

/// The default capacity of the diff_id-by-compressed-digest cache.
pub const DEFAULT_DIFF_ID_CACHE_CAPACITY: u64 = 1024;

/// Default timeout for a single handover socket operation.
pub const DEFAULT_HANDOVER_TIMEOUT_SECS: u64 = 10;

/// Default timeout for resolving an image spec.
pub const DEFAULT_SPEC_FETCH_TIMEOUT_SECS: u64 = 30;

/// Default timeout for a single manifest synthesis.
pub const DEFAULT_SYNTHESIS_TIMEOUT_SECS: u64 = 60;

/// Default idle timeout for blob streaming (no data received for this long aborts the stream).
pub const DEFAULT_BLOB_IDLE_TIMEOUT_SECS: u64 = 60;

/// The media type of a synthesized OCI image manifest.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// The media type of a Docker v2 image manifest, accepted as an alternate `Accept` header.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// The media type of a synthesized OCI image config.
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// The media type a file-based layer source must have on disk.
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// The `created_by` history entry attributed to layers this facade adds.
pub const SYNTHESIZED_HISTORY_CREATED_BY: &str = "registry-facade";

/// Filename prefix for handover sockets, followed by `<unix-seconds>.sock`.
pub const HANDOVER_SOCKET_PREFIX: &str = "rf-handover-";

/// The base image reference the always-on `static` spec provider hands out when the operator
/// configures no whole-image `--static-layer` entry of their own.
pub const DEFAULT_STATIC_BASE_REF: &str = "docker.io/library/alpine:latest";

/// The default address the facade listens on, combining [`DEFAULT_SERVER_HOST`] and
/// [`DEFAULT_SERVER_PORT`].
pub static DEFAULT_SERVER_IP: LazyLock<IpAddr> =
    LazyLock::new(|| DEFAULT_SERVER_HOST.parse().expect("valid default host"));

/// The default root directory for facade state (blob store, handover sockets) under the
/// user's home directory, used when no `--store`/`--handover-dir` is given.
pub static DEFAULT_FACADE_HOME: LazyLock<PathBuf> =
    LazyLock::new(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".registry-facade"));

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_host_and_port_match_expected() {
        assert_eq!(DEFAULT_SERVER_HOST, "0.0.0.0");
        assert_eq!(DEFAULT_SERVER_PORT, 5000u16);
    }

    #[test]
    fn default_server_ip_parses() {
        assert_eq!(*DEFAULT_SERVER_IP, DEFAULT_SERVER_HOST.parse::<IpAddr>().unwrap());
    }

    #[test]
    fn default_caches_are_nonzero() {
        assert!(DEFAULT_SPEC_CACHE_CAPACITY > 0);
        assert!(DEFAULT_MANIFEST_CACHE_CAPACITY > 0);
        assert!(DEFAULT_DIFF_ID_CACHE_CAPACITY > 0);
        assert!(DEFAULT_IMAGE_ENVELOPE_CACHE_CAPACITY > 0);
    }

    #[test]
    fn handover_socket_prefix_is_stable() {
        assert_eq!(HANDOVER_SOCKET_PREFIX, "rf-handover-");
    }

    #[test]
    fn default_static_base_ref_is_nonempty() {
        assert!(!DEFAULT_STATIC_BASE_REF.is_empty());
    }
}
