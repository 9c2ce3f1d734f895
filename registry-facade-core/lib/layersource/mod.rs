//! Layer source trait and its four leaf variants (§4.C) plus the composite that concatenates
//! them in declared order (§4.D).

pub mod composite;
pub mod content;
pub mod file;
pub mod spec_image;
pub mod static_image;

pub use composite::CompositeLayerSource;
pub use content::ContentLayerSource;
pub use file::FileLayerSource;
pub use spec_image::{Role, SpecImageSource};
pub use static_image::StaticImageSource;

pub use crate::model::ContentLayerEntry;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use oci_spec::image::Digest;

use crate::{error::CoreResult, model::Descriptor};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The whole-image contribution of a layer source that owns a base image tree: a config
/// descriptor plus the config's own layer descriptors, in the order they must be stacked.
#[derive(Debug, Clone)]
pub struct ImageEnvelope {
    /// The digest of the resolved manifest this envelope was built from, used as an input to
    /// the synthesis fingerprint (§3 Fingerprint).
    pub resolved_digest: Digest,
    /// The descriptor of this image's config blob.
    pub config: Descriptor,
    /// The raw config bytes, exactly as served by the upstream (needed verbatim by the config
    /// modifier, which re-derives a new config from these bytes).
    pub config_bytes: Bytes,
    /// The image's layer descriptors, base-first.
    pub layers: Vec<Descriptor>,
}

/// Classifies a leaf (or composite) layer source for the purposes of fingerprint computation
/// (§3 Fingerprint groups digests into base/ide/static/content buckets). Purely descriptive —
/// it has no bearing on [`LayerSource`] dispatch itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Contributes the workspace base image.
    BaseImage,
    /// Contributes the IDE image.
    IdeImage,
    /// Contributes a statically pinned image.
    StaticImage,
    /// Contributes a single local file layer.
    File,
    /// Contributes a dynamic content layer.
    Content,
    /// A composite of other sources.
    Composite,
}

/// A polymorphic capability set implemented by each leaf and by the composite (§4.C, §4.D).
#[async_trait]
pub trait LayerSource: Send + Sync {
    /// Identifies what kind of source this is, for fingerprint bucketing (§3).
    fn kind(&self) -> SourceKind;

    /// Returns the whole-image envelope this source contributes, if it is a whole-image
    /// source (spec-image, static-image). Leaves that only add layers return `Ok(None)`.
    async fn get_image_spec(&self) -> CoreResult<Option<ImageEnvelope>> {
        Ok(None)
    }

    /// Returns the layer descriptors this source contributes to the composed manifest.
    async fn envelope(&self) -> CoreResult<Vec<Descriptor>>;

    /// Returns `true` if this source owns the given digest (as either a layer or a config).
    ///
    /// Async because a lazily-resolving source (e.g. [`spec_image::SpecImageSource`]) must be
    /// able to resolve its envelope on demand here too — a blob GET can be the first request
    /// to touch a fresh per-request instance, with no prior `envelope`/`get_image_spec` call to
    /// have already populated it.
    async fn has(&self, digest: &Digest) -> bool;

    /// Streams the blob for `digest`, optionally starting at `offset` for `length` bytes.
    async fn get_blob(
        &self,
        digest: &Digest,
        offset: u64,
        length: Option<u64>,
    ) -> CoreResult<BoxStream<'static, CoreResult<Bytes>>>;
}
