//! Core data types shared across the synthesis pipeline: the resolved [`ImageSpec`] that
//! drives a single synthesis, its content-layer entries, the [`Descriptor`] identity triple used
//! throughout manifests, and the fingerprint used to key the manifest cache.

use std::collections::BTreeMap;

use getset::Getters;
use oci_client::Reference;
use oci_spec::image::Digest;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use url::Url;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The `(mediaType, digest, size)` identity triple used to reference blobs within a manifest
/// (§3 Data Model). Kept as a plain struct rather than reused from `oci_spec::image` so that
/// JSON field casing and serialization order are fully under this crate's control, which
/// invariant #4 (byte-identical synthesis) depends on.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize)]
#[getset(get = "pub with_prefix")]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The media type of the referenced blob.
    media_type: String,

    /// The digest of the referenced blob.
    digest: Digest,

    /// The size of the referenced blob, in bytes.
    size: u64,

    /// Alternate locations the blob can be fetched from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    urls: Option<Vec<String>>,

    /// Arbitrary metadata attached to the descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    annotations: Option<BTreeMap<String, String>>,
}

/// The resolved input to a single manifest synthesis, as produced by a spec provider (§4.E).
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ImageSpec {
    /// The reference of the workspace base image.
    base_ref: Reference,

    /// The reference of an image whose layers provide the IDE tooling, if any.
    ide_ref: Option<Reference>,

    /// Ordered dynamic content layers contributed by this spec.
    content_layer: Vec<ContentLayerEntry>,

    /// Environment variables to merge into the synthesized config (`KEY=VALUE`), spec wins
    /// on key collision with the base image.
    env_vars: Vec<String>,

    /// Overrides the base image's entrypoint, if provided.
    entrypoint: Option<Vec<String>>,

    /// Overrides the base image's default command, if provided.
    cmd: Option<Vec<String>>,

    /// Overrides the base image's user, if provided.
    user: Option<String>,
}

/// A single dynamic content layer declared by an [`ImageSpec`].
#[derive(Debug, Clone)]
pub enum ContentLayerEntry {
    /// A layer whose bytes are supplied inline and must be written into the blob store on
    /// first use.
    Inline {
        /// The layer's media type, must be a gzip'd OCI tar layer.
        media_type: String,
        /// The digest of the compressed layer bytes.
        digest: Digest,
        /// The size of the compressed layer bytes.
        size: u64,
        /// The compressed layer bytes.
        data: bytes::Bytes,
    },

    /// A layer whose bytes are fetched on demand from a remote URL.
    Remote {
        /// The layer's media type, must be a gzip'd OCI tar layer.
        media_type: String,
        /// The digest of the compressed layer bytes.
        digest: Digest,
        /// The size of the compressed layer bytes.
        size: u64,
        /// The URL the bytes are streamed from.
        url: Url,
    },
}

/// Facade-internal cache key over the resolved inputs of a synthesis (§3 Fingerprint).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageSpec {
    /// Creates a new image spec.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_ref: Reference,
        ide_ref: Option<Reference>,
        content_layer: Vec<ContentLayerEntry>,
        env_vars: Vec<String>,
        entrypoint: Option<Vec<String>>,
        cmd: Option<Vec<String>>,
        user: Option<String>,
    ) -> Self {
        Self {
            base_ref,
            ide_ref,
            content_layer,
            env_vars,
            entrypoint,
            cmd,
            user,
        }
    }
}

impl Descriptor {
    /// Creates a new descriptor.
    pub fn new(
        media_type: impl Into<String>,
        digest: Digest,
        size: u64,
        urls: Option<Vec<String>>,
        annotations: Option<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls,
            annotations,
        }
    }

    /// Converts an `oci-client` manifest descriptor into this crate's [`Descriptor`].
    pub fn from_oci(descriptor: &oci_client::manifest::OciDescriptor) -> crate::error::CoreResult<Self> {
        let digest: Digest = descriptor.digest.parse().map_err(|_| {
            crate::error::CoreError::custom(anyhow::anyhow!(
                "invalid digest in upstream descriptor: {}",
                descriptor.digest
            ))
        })?;

        Ok(Self {
            media_type: descriptor.media_type.clone(),
            digest,
            size: descriptor.size as u64,
            urls: descriptor.urls.clone(),
            annotations: descriptor
                .annotations
                .clone()
                .map(|a| a.into_iter().collect()),
        })
    }
}

/// Computes the canonical `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(bytes: &[u8]) -> Digest {
    let hash = Sha256::digest(bytes);
    format!("sha256:{}", hex::encode(hash))
        .parse()
        .expect("sha256 hex digest is always a valid Digest")
}

impl ContentLayerEntry {
    /// The digest of this layer's compressed bytes.
    pub fn digest(&self) -> &Digest {
        match self {
            ContentLayerEntry::Inline { digest, .. } => digest,
            ContentLayerEntry::Remote { digest, .. } => digest,
        }
    }

    /// The size of this layer's compressed bytes.
    pub fn size(&self) -> u64 {
        match self {
            ContentLayerEntry::Inline { size, .. } => *size,
            ContentLayerEntry::Remote { size, .. } => *size,
        }
    }

    /// This layer's media type.
    pub fn media_type(&self) -> &str {
        match self {
            ContentLayerEntry::Inline { media_type, .. } => media_type,
            ContentLayerEntry::Remote { media_type, .. } => media_type,
        }
    }
}

impl Fingerprint {
    /// Computes a fingerprint over the resolved inputs of a synthesis: the base and IDE
    /// reference digests, the ordered list of static and content-layer digests, and a
    /// normalized encoding of the config overrides. Order-sensitive, matching the order layers
    /// are stacked in the synthesized manifest.
    pub fn compute(
        base_digest: &Digest,
        ide_digest: Option<&Digest>,
        static_digests: &[Digest],
        content_digests: &[Digest],
        config_overrides: &str,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(base_digest.to_string().as_bytes());
        hasher.update(b"\0");
        if let Some(ide) = ide_digest {
            hasher.update(ide.to_string().as_bytes());
        }
        hasher.update(b"\0");
        for digest in static_digests {
            hasher.update(digest.to_string().as_bytes());
            hasher.update(b",");
        }
        hasher.update(b"\0");
        for digest in content_digests {
            hasher.update(digest.to_string().as_bytes());
            hasher.update(b",");
        }
        hasher.update(b"\0");
        hasher.update(config_overrides.as_bytes());

        Fingerprint(hex::encode(hasher.finalize()))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn fingerprint_is_deterministic() {
        let base = Digest::from_str(&format!("sha256:{}", "a".repeat(64))).unwrap();
        let fp1 = Fingerprint::compute(&base, None, &[], &[], "{}");
        let fp2 = Fingerprint::compute(&base, None, &[], &[], "{}");
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn fingerprint_differs_on_config_overrides() {
        let base = Digest::from_str(&format!("sha256:{}", "b".repeat(64))).unwrap();
        let fp1 = Fingerprint::compute(&base, None, &[], &[], "{\"a\":1}");
        let fp2 = Fingerprint::compute(&base, None, &[], &[], "{\"a\":2}");
        assert_ne!(fp1, fp2);
    }
}
