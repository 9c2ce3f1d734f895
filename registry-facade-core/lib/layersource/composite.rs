//! The composite layer source (§4.D): concatenates child sources in declared order, deduplicating
//! by digest so a layer shared by two children (e.g. base and IDE images sharing a common base
//! layer) is only listed — and served — once.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use oci_spec::image::Digest;

use crate::{
    error::{CoreError, CoreResult},
    model::Descriptor,
};

use super::{ImageEnvelope, LayerSource, SourceKind};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A layer source composed of an ordered list of children. A digest already contributed by an
/// earlier child is skipped when a later child would contribute it again.
pub struct CompositeLayerSource {
    children: Vec<Arc<dyn LayerSource>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CompositeLayerSource {
    /// Creates a composite over `children`, preserving their order.
    pub fn new(children: Vec<Arc<dyn LayerSource>>) -> Self {
        Self { children }
    }

    /// The children of this composite, in declared order. Used by the synthesizer to bucket
    /// digests by [`SourceKind`] when computing a fingerprint (§3).
    pub fn children(&self) -> &[Arc<dyn LayerSource>] {
        &self.children
    }

    /// Finds the first child claiming ownership of `digest`.
    async fn owner(&self, digest: &Digest) -> Option<&Arc<dyn LayerSource>> {
        for child in &self.children {
            if child.has(digest).await {
                return Some(child);
            }
        }
        None
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl LayerSource for CompositeLayerSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Composite
    }

    async fn get_image_spec(&self) -> CoreResult<Option<ImageEnvelope>> {
        // A composite never itself stands in for a whole-image contribution; the synthesizer
        // queries children directly by role to build the base image + config.
        Ok(None)
    }

    async fn envelope(&self) -> CoreResult<Vec<Descriptor>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        for child in &self.children {
            for descriptor in child.envelope().await? {
                if seen.insert(descriptor.get_digest().clone()) {
                    out.push(descriptor);
                }
            }
        }

        Ok(out)
    }

    async fn has(&self, digest: &Digest) -> bool {
        self.owner(digest).await.is_some()
    }

    async fn get_blob(
        &self,
        digest: &Digest,
        offset: u64,
        length: Option<u64>,
    ) -> CoreResult<BoxStream<'static, CoreResult<Bytes>>> {
        let owner = self
            .owner(digest)
            .await
            .ok_or_else(|| CoreError::BlobUnknown(digest.clone()))?
            .clone();

        owner.get_blob(digest, offset, length).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sha256_digest;
    use futures::stream;

    struct StubSource {
        kind: SourceKind,
        descriptors: Vec<Descriptor>,
        bytes: Bytes,
    }

    #[async_trait]
    impl LayerSource for StubSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn envelope(&self) -> CoreResult<Vec<Descriptor>> {
            Ok(self.descriptors.clone())
        }

        async fn has(&self, digest: &Digest) -> bool {
            self.descriptors.iter().any(|d| d.get_digest() == digest)
        }

        async fn get_blob(
            &self,
            _digest: &Digest,
            _offset: u64,
            _length: Option<u64>,
        ) -> CoreResult<BoxStream<'static, CoreResult<Bytes>>> {
            let bytes = self.bytes.clone();
            Ok(Box::pin(stream::once(async move { Ok(bytes) })))
        }
    }

    fn stub(kind: SourceKind, payload: &'static [u8]) -> Arc<dyn LayerSource> {
        let digest = sha256_digest(payload);
        let descriptor = Descriptor::new(
            "application/vnd.oci.image.layer.v1.tar+gzip",
            digest,
            payload.len() as u64,
            None,
            None,
        );
        Arc::new(StubSource {
            kind,
            descriptors: vec![descriptor],
            bytes: Bytes::from_static(payload),
        })
    }

    #[tokio::test]
    async fn concatenates_children_in_order() {
        let a = stub(SourceKind::BaseImage, b"aaa");
        let b = stub(SourceKind::File, b"bbb");
        let composite = CompositeLayerSource::new(vec![a, b]);

        let envelope = composite.envelope().await.unwrap();
        assert_eq!(envelope.len(), 2);
    }

    #[tokio::test]
    async fn deduplicates_shared_digests() {
        let shared_digest = sha256_digest(b"shared");
        let descriptor = Descriptor::new(
            "application/vnd.oci.image.layer.v1.tar+gzip",
            shared_digest,
            6,
            None,
            None,
        );
        let a: Arc<dyn LayerSource> = Arc::new(StubSource {
            kind: SourceKind::BaseImage,
            descriptors: vec![descriptor.clone()],
            bytes: Bytes::from_static(b"shared"),
        });
        let b: Arc<dyn LayerSource> = Arc::new(StubSource {
            kind: SourceKind::IdeImage,
            descriptors: vec![descriptor],
            bytes: Bytes::from_static(b"shared"),
        });

        let composite = CompositeLayerSource::new(vec![a, b]);
        let envelope = composite.envelope().await.unwrap();
        assert_eq!(envelope.len(), 1);
    }

    #[tokio::test]
    async fn routes_get_blob_to_owning_child() {
        let a = stub(SourceKind::BaseImage, b"aaa");
        let b = stub(SourceKind::File, b"bbb");
        let b_digest = sha256_digest(b"bbb");
        let composite = CompositeLayerSource::new(vec![a, b]);

        assert!(composite.has(&b_digest).await);
        let _ = composite.get_blob(&b_digest, 0, None).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_digest_is_rejected() {
        let a = stub(SourceKind::BaseImage, b"aaa");
        let composite = CompositeLayerSource::new(vec![a]);

        let bogus = sha256_digest(b"nope");
        let err = composite.get_blob(&bogus, 0, None).await.unwrap_err();
        assert!(matches!(err, CoreError::BlobUnknown(_)));
    }
}
