//! Blob router (§4.H): given a digest and an optional byte range, decides whether the store (A)
//! already has the blob or whether it must be fetched from the owning layer source, tee-ing
//! upstream bytes into the store as they're served so a later request for the same digest is
//! local.

use std::sync::Arc;

use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use oci_spec::image::Digest;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::{
    error::{CoreError, CoreResult},
    layersource::CompositeLayerSource,
    store::{BlobStore, BlobWriter},
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A byte range requested against a blob, inclusive on both ends (matching HTTP's `Range`
/// header rather than Rust's half-open `Range<u64>`).
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    /// The first byte to serve, inclusive.
    pub start: u64,
    /// The last byte to serve, inclusive.
    pub end_inclusive: u64,
}

/// The outcome of resolving a blob GET/HEAD: a byte stream plus the metadata needed to set
/// `Content-Length` and, for a partial response, `Content-Range`.
pub struct RoutedBlob {
    /// The blob's bytes, from `offset` for the requested span.
    pub stream: BoxStream<'static, CoreResult<Bytes>>,
    /// The number of bytes the stream will yield.
    pub content_length: u64,
    /// Set when the response is a range (`206 Partial Content`): `(start, end_inclusive, total_size)`.
    pub content_range: Option<(u64, u64, u64)>,
}

/// Routes blob GET/HEAD requests to the blob store or the owning layer source (§4.H).
#[derive(Clone)]
pub struct BlobRouter {
    store: BlobStore,
    composite: Arc<CompositeLayerSource>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BlobRouter {
    /// Creates a router over the given store and composite layer source.
    pub fn new(store: BlobStore, composite: Arc<CompositeLayerSource>) -> Self {
        Self { store, composite }
    }

    /// Resolves `digest`, optionally restricted to `range`, to a streamable response.
    ///
    /// Resolution order (§4.H): local store first; otherwise the composite's owning child,
    /// tee'd into the store as it streams; `BlobUnknown` if no source claims the digest.
    pub async fn route(&self, digest: &Digest, range: Option<ByteRange>) -> CoreResult<RoutedBlob> {
        if self.store.has(digest) {
            return self.serve_from_store(digest, range).await;
        }

        if !self.composite.has(digest).await {
            return Err(CoreError::BlobUnknown(digest.clone()));
        }

        self.serve_and_tee(digest, range).await
    }

    /// Serves a blob already committed to the store, honoring a byte range directly via seek.
    async fn serve_from_store(&self, digest: &Digest, range: Option<ByteRange>) -> CoreResult<RoutedBlob> {
        let size = self
            .store
            .size(digest)
            .await?
            .ok_or_else(|| CoreError::BlobUnknown(digest.clone()))?;

        match range {
            None => {
                let file = self.store.open(digest).await?;
                let stream = ReaderStream::new(file).map(|r| r.map_err(CoreError::from)).boxed();
                Ok(RoutedBlob {
                    stream,
                    content_length: size,
                    content_range: None,
                })
            }
            Some(range) => {
                validate_range(range, size)?;
                let mut file = self.store.open(digest).await?;
                file.seek(std::io::SeekFrom::Start(range.start)).await?;
                let len = range.end_inclusive - range.start + 1;
                let stream = ReaderStream::new(file.take(len))
                    .map(|r| r.map_err(CoreError::from))
                    .boxed();

                Ok(RoutedBlob {
                    stream,
                    content_length: len,
                    content_range: Some((range.start, range.end_inclusive, size)),
                })
            }
        }
    }

    /// Serves a blob from its owning layer source, tee-ing the bytes into the store so the
    /// next request for the same digest is served locally (§4.H step 2).
    ///
    /// Per §9's resolution of the Range-against-inline-content open question, a range request
    /// against a blob not yet in the store always fetches the whole blob from its source (so
    /// the tee captures it in full for caching) and slices the requested window out of the
    /// stream in-process, rather than forwarding a partial range to every source kind.
    async fn serve_and_tee(&self, digest: &Digest, range: Option<ByteRange>) -> CoreResult<RoutedBlob> {
        let size = self.composite_blob_size(digest).await?;
        let upstream = self.composite.get_blob(digest, 0, None).await?;
        let writer = self.store.writer(Some(digest.clone())).await?;
        let tee = tee_into_store(upstream, writer);

        match range {
            None => Ok(RoutedBlob {
                stream: tee,
                content_length: size,
                content_range: None,
            }),
            Some(range) => {
                validate_range(range, size)?;
                let len = range.end_inclusive - range.start + 1;
                Ok(RoutedBlob {
                    stream: slice_stream(tee, range.start, len),
                    content_length: len,
                    content_range: Some((range.start, range.end_inclusive, size)),
                })
            }
        }
    }

    /// Looks up `digest`'s declared size from the composite's envelope (§4.I): known up front
    /// from the owning source's descriptor, so a HEAD for a blob not yet in the store can still
    /// report `Content-Length` without reading a byte of it.
    async fn composite_blob_size(&self, digest: &Digest) -> CoreResult<u64> {
        self.composite
            .envelope()
            .await?
            .into_iter()
            .find(|d| d.get_digest() == digest)
            .map(|d| *d.get_size())
            .ok_or_else(|| CoreError::BlobUnknown(digest.clone()))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Forks an upstream byte stream into the caller's response and a committing [`BlobWriter`]. On
/// clean completion (stream exhausted) the staged blob is committed; a stream error aborts the
/// write; the stream being dropped before completion (client disconnect, cancellation) leaves
/// the staged file uncommitted — never visible under its digest, cleaned up by external GC
/// (§4.A, out of scope).
fn tee_into_store(
    inner: BoxStream<'static, CoreResult<Bytes>>,
    writer: BlobWriter,
) -> BoxStream<'static, CoreResult<Bytes>> {
    futures::stream::unfold((inner, Some(writer)), |(mut inner, mut writer)| async move {
        match inner.next().await {
            Some(Ok(chunk)) => {
                if let Some(w) = writer.as_mut()
                    && let Err(err) = w.write_all(&chunk).await
                {
                    tracing::warn!(%err, "tee write to blob store failed, continuing without caching");
                    writer = None;
                }
                Some((Ok(chunk), (inner, writer)))
            }
            Some(Err(err)) => {
                writer = None;
                Some((Err(err), (inner, writer)))
            }
            None => {
                if let Some(w) = writer.take()
                    && let Err(err) = w.commit().await
                {
                    tracing::warn!(%err, "tee commit failed");
                }
                None
            }
        }
    })
    .boxed()
}

/// Slices `skip` bytes then `take` bytes out of a chunked byte stream, without buffering the
/// whole stream in memory.
fn slice_stream(
    inner: BoxStream<'static, CoreResult<Bytes>>,
    skip: u64,
    take: u64,
) -> BoxStream<'static, CoreResult<Bytes>> {
    futures::stream::unfold((inner, skip, take), |(mut inner, mut skip, mut take)| async move {
        loop {
            if take == 0 {
                return None;
            }

            match inner.next().await {
                Some(Ok(chunk)) => {
                    let to_skip = skip.min(chunk.len() as u64) as usize;
                    skip -= to_skip as u64;
                    let remaining = chunk.slice(to_skip..);
                    if remaining.is_empty() {
                        continue;
                    }

                    let to_take = (take as usize).min(remaining.len());
                    take -= to_take as u64;
                    let out = remaining.slice(..to_take);
                    return Some((Ok(out), (inner, skip, take)));
                }
                Some(Err(err)) => return Some((Err(err), (inner, skip, take))),
                None => return None,
            }
        }
    })
    .boxed()
}

fn validate_range(range: ByteRange, size: u64) -> CoreResult<()> {
    if range.start > range.end_inclusive || range.end_inclusive >= size {
        return Err(CoreError::RangeUnsatisfiable(
            range.start,
            Some(range.end_inclusive),
            size,
        ));
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layersource::{CompositeLayerSource, ImageEnvelope, LayerSource, SourceKind},
        model::{Descriptor, sha256_digest},
    };
    use async_trait::async_trait;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    struct StubUpstream {
        digest: Digest,
        bytes: Bytes,
    }

    #[async_trait]
    impl LayerSource for StubUpstream {
        fn kind(&self) -> SourceKind {
            SourceKind::File
        }

        async fn get_image_spec(&self) -> CoreResult<Option<ImageEnvelope>> {
            Ok(None)
        }

        async fn envelope(&self) -> CoreResult<Vec<Descriptor>> {
            Ok(vec![Descriptor::new(
                "application/vnd.oci.image.layer.v1.tar+gzip",
                self.digest.clone(),
                self.bytes.len() as u64,
                None,
                None,
            )])
        }

        async fn has(&self, digest: &Digest) -> bool {
            &self.digest == digest
        }

        async fn get_blob(
            &self,
            digest: &Digest,
            _offset: u64,
            _length: Option<u64>,
        ) -> CoreResult<BoxStream<'static, CoreResult<Bytes>>> {
            if &self.digest != digest {
                return Err(CoreError::BlobUnknown(digest.clone()));
            }
            let bytes = self.bytes.clone();
            Ok(futures::stream::once(async move { Ok(bytes) }).boxed())
        }
    }

    async fn router_with_upstream(payload: &'static [u8]) -> (BlobRouter, Digest, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path()).await.unwrap();
        let digest = sha256_digest(payload);
        let upstream: Arc<dyn LayerSource> = Arc::new(StubUpstream {
            digest: digest.clone(),
            bytes: Bytes::from_static(payload),
        });
        let composite = Arc::new(CompositeLayerSource::new(vec![upstream]));
        (BlobRouter::new(store, composite), digest, dir)
    }

    #[tokio::test]
    async fn serves_full_blob_from_upstream_and_caches_it() {
        let (router, digest, _dir) = router_with_upstream(b"hello upstream").await;

        let routed = router.route(&digest, None).await.unwrap();
        let chunks: Vec<Bytes> = routed.stream.try_collect().await.unwrap();
        let all: Vec<u8> = chunks.into_iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(all, b"hello upstream");

        assert!(router.store.has(&digest));
    }

    #[tokio::test]
    async fn second_fetch_is_served_from_store() {
        let (router, digest, _dir) = router_with_upstream(b"cache me").await;

        let first = router.route(&digest, None).await.unwrap();
        let _: Vec<Bytes> = first.stream.try_collect().await.unwrap();

        let second = router.route(&digest, None).await.unwrap();
        assert_eq!(second.content_length, 8);
        let chunks: Vec<Bytes> = second.stream.try_collect().await.unwrap();
        let all: Vec<u8> = chunks.into_iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(all, b"cache me");
    }

    #[tokio::test]
    async fn range_request_against_cached_blob_slices_correctly() {
        let (router, digest, _dir) = router_with_upstream(b"0123456789").await;

        let warm = router.route(&digest, None).await.unwrap();
        let _: Vec<Bytes> = warm.stream.try_collect().await.unwrap();

        let ranged = router
            .route(
                &digest,
                Some(ByteRange {
                    start: 2,
                    end_inclusive: 4,
                }),
            )
            .await
            .unwrap();
        assert_eq!(ranged.content_range, Some((2, 4, 10)));
        let chunks: Vec<Bytes> = ranged.stream.try_collect().await.unwrap();
        let all: Vec<u8> = chunks.into_iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(all, b"234");
    }

    #[tokio::test]
    async fn range_request_against_uncached_blob_slices_the_tee() {
        let (router, digest, _dir) = router_with_upstream(b"0123456789").await;

        let ranged = router
            .route(
                &digest,
                Some(ByteRange {
                    start: 3,
                    end_inclusive: 5,
                }),
            )
            .await
            .unwrap();
        let chunks: Vec<Bytes> = ranged.stream.try_collect().await.unwrap();
        let all: Vec<u8> = chunks.into_iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(all, b"345");
    }

    #[tokio::test]
    async fn unknown_digest_is_rejected() {
        let (router, _digest, _dir) = router_with_upstream(b"known").await;
        let bogus = sha256_digest(b"unknown");
        let err = router.route(&bogus, None).await.unwrap_err();
        assert!(matches!(err, CoreError::BlobUnknown(_)));
    }

    #[tokio::test]
    async fn uncached_blob_reports_its_real_length_without_reading_it() {
        let (router, digest, _dir) = router_with_upstream(b"hello upstream").await;

        let routed = router.route(&digest, None).await.unwrap();
        assert_eq!(routed.content_length, b"hello upstream".len() as u64);
    }
}
