//! `registry_facade_core::error` is a module containing error utilities for the synthesis pipeline.

use std::{
    error::Error,
    fmt::{self, Display},
    sync::Arc,
};

use oci_spec::image::Digest;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a registry-facade-core operation.
pub type CoreResult<T> = Result<T, CoreError>;

/// An error that occurred somewhere in the synthesis pipeline.
#[derive(pretty_error_debug::Debug, Error)]
pub enum CoreError {
    /// The requested repository name could not be mapped to a known spec provider.
    #[error("name unknown: {0}")]
    NameUnknown(String),

    /// A manifest could not be produced for the resolved spec.
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    /// The requested blob digest is not owned by any layer source nor present in the store.
    #[error("blob unknown: {0}")]
    BlobUnknown(Digest),

    /// The caller is not authorized to perform the request.
    #[error("unauthorized")]
    Unauthorized,

    /// A blob's computed digest did not match the digest it was written under.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest the blob was expected to have.
        expected: Digest,
        /// The digest actually computed from the bytes written.
        actual: Digest,
    },

    /// A requested byte range could not be satisfied against the blob's size.
    #[error("range unsatisfiable: {0}-{1:?} against size {2}")]
    RangeUnsatisfiable(u64, Option<u64>, u64),

    /// The remote spec provider could not be reached.
    #[error("spec unavailable: {0}")]
    SpecUnavailable(String),

    /// The remote spec provider has no spec for the requested name.
    #[error("spec not found: {0}")]
    SpecNotFound(String),

    /// The remote spec provider returned a response that could not be interpreted.
    #[error("spec malformed: {0}")]
    SpecMalformed(String),

    /// An upstream registry could not be reached or returned an error.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// An error occurred while handling a specific layer.
    #[error("layer handling error for {digest}: {source}")]
    LayerHandling {
        /// The digest of the layer being handled.
        digest: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// An error that occurred when performing an IO operation.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// An error that occurred while talking to an upstream registry via `oci-client`.
    #[error("oci client error: {0}")]
    OciDistribution(#[from] oci_client::errors::OciDistributionError),

    /// An error that occurred while parsing an OCI reference.
    #[error("oci reference parse error: {0}")]
    OciParse(#[from] oci_client::ParseError),

    /// An error that occurred while parsing or building an OCI spec type.
    #[error("oci spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),

    /// An error that occurred during a Serde JSON operation.
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error that occurred while making an HTTP request to a content-layer URL.
    #[error("http request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// An error surfaced by the `reqwest-middleware` retry layer wrapping a content-layer
    /// fetch (§7): either a `reqwest::Error` the retry policy gave up on, or a middleware
    /// failure (e.g. policy misconfiguration) unrelated to the request itself.
    #[error("http middleware error: {0}")]
    ReqwestMiddleware(#[from] reqwest_middleware::Error),

    /// Custom error.
    #[error("custom error: {0}")]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CoreError {
    /// Creates a new `Err` result wrapping an arbitrary error.
    pub fn custom(error: impl Into<anyhow::Error>) -> CoreError {
        CoreError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Reconstructs an owned error from a `moka`-cached `Arc<CoreError>` (the shape
    /// `try_get_with` hands back to every awaiter of a failed singleflight), preserving the
    /// registry-v2 classification of the simple variants instead of collapsing everything
    /// behind them into [`CoreError::Custom`].
    pub fn from_cached(err: &Arc<CoreError>) -> CoreError {
        match err.as_ref() {
            CoreError::NameUnknown(s) => CoreError::NameUnknown(s.clone()),
            CoreError::ManifestUnknown(s) => CoreError::ManifestUnknown(s.clone()),
            CoreError::BlobUnknown(d) => CoreError::BlobUnknown(d.clone()),
            CoreError::Unauthorized => CoreError::Unauthorized,
            CoreError::DigestMismatch { expected, actual } => CoreError::DigestMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            CoreError::RangeUnsatisfiable(start, len, size) => {
                CoreError::RangeUnsatisfiable(*start, *len, *size)
            }
            CoreError::SpecUnavailable(s) => CoreError::SpecUnavailable(s.clone()),
            CoreError::SpecNotFound(s) => CoreError::SpecNotFound(s.clone()),
            CoreError::SpecMalformed(s) => CoreError::SpecMalformed(s.clone()),
            CoreError::UpstreamUnavailable(s) => CoreError::UpstreamUnavailable(s.clone()),
            other => CoreError::custom(anyhow::anyhow!("{other}")),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
