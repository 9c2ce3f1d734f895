//! The static-image layer source (§4.C): a whole-image contribution pinned to a single
//! operator-configured reference, resolved once at startup rather than per spec.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use oci_client::{Reference, secrets::RegistryAuth};
use oci_spec::image::Digest;

use crate::{
    error::{CoreError, CoreResult},
    model::Descriptor,
    upstream::UpstreamResolver,
};

use super::{ImageEnvelope, LayerSource, SourceKind};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A layer source pinned to a fixed reference, resolved once when the source is constructed
/// and held for the process lifetime. Unlike [`super::SpecImageSource`], the reference does not
/// vary per request — it is the same static image shared by every synthesis that includes it.
pub struct StaticImageSource {
    reference: Reference,
    resolver: UpstreamResolver,
    auth: RegistryAuth,
    envelope: ImageEnvelope,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StaticImageSource {
    /// Resolves `reference` against upstream immediately, producing a source whose envelope is
    /// already populated. Goes through [`UpstreamResolver::resolve_envelope`]'s shared cache so
    /// a static layer pinned to the same reference a spec also resolves (e.g. sharing a base
    /// image) is only ever fetched once.
    pub async fn resolve(
        reference: &Reference,
        resolver: &UpstreamResolver,
        auth: RegistryAuth,
    ) -> CoreResult<Self> {
        let envelope = resolver.resolve_envelope(reference, auth.clone()).await?;

        Ok(Self {
            reference: reference.clone(),
            resolver: resolver.clone(),
            auth,
            envelope,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl LayerSource for StaticImageSource {
    fn kind(&self) -> SourceKind {
        SourceKind::StaticImage
    }

    async fn get_image_spec(&self) -> CoreResult<Option<ImageEnvelope>> {
        Ok(Some(self.envelope.clone()))
    }

    async fn envelope(&self) -> CoreResult<Vec<Descriptor>> {
        Ok(self.envelope.layers.clone())
    }

    async fn has(&self, digest: &Digest) -> bool {
        self.envelope.config.get_digest() == digest
            || self.envelope.layers.iter().any(|l| l.get_digest() == digest)
    }

    async fn get_blob(
        &self,
        digest: &Digest,
        offset: u64,
        length: Option<u64>,
    ) -> CoreResult<BoxStream<'static, CoreResult<Bytes>>> {
        if self.envelope.config.get_digest() == digest {
            let start = (offset as usize).min(self.envelope.config_bytes.len());
            let end = match length {
                Some(len) => (start + len as usize).min(self.envelope.config_bytes.len()),
                None => self.envelope.config_bytes.len(),
            };
            let slice = self.envelope.config_bytes.slice(start..end);
            return Ok(Box::pin(futures::stream::once(async move { Ok(slice) })));
        }

        if !self.envelope.layers.iter().any(|l| l.get_digest() == digest) {
            return Err(CoreError::BlobUnknown(digest.clone()));
        }

        let fetcher = self.resolver.fetcher_for(self.auth.clone());
        fetcher
            .fetch_digest_blob(&self.reference, digest, offset, length)
            .await
    }
}
