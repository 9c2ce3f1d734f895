//! The content layer source (§4.C): dynamic layers declared inline by an [`ImageSpec`], either
//! carried as bytes or fetched on demand from a remote URL.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use oci_spec::image::Digest;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};

use crate::{
    error::{CoreError, CoreResult},
    model::{ContentLayerEntry, Descriptor},
};

use super::{ImageEnvelope, LayerSource, SourceKind};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A layer source wrapping the content layers declared on an [`ImageSpec`] (§4.C). Order is
/// preserved exactly as declared; layers are served from memory (inline) or streamed from their
/// origin URL (remote) without ever buffering the whole remote body.
pub struct ContentLayerSource {
    entries: Vec<ContentLayerEntry>,
    client: ClientWithMiddleware,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContentLayerSource {
    /// Creates a new content layer source from the spec's declared entries, in order. Remote
    /// fetches retry transient failures with bounded exponential backoff (§7), the same
    /// `reqwest-middleware`/`reqwest-retry` pairing the teacher's `Ghcr::new` builds.
    pub fn new(entries: Vec<ContentLayerEntry>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self { entries, client }
    }

    fn find(&self, digest: &Digest) -> Option<&ContentLayerEntry> {
        self.entries.iter().find(|e| e.digest() == digest)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl LayerSource for ContentLayerSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Content
    }

    async fn get_image_spec(&self) -> CoreResult<Option<ImageEnvelope>> {
        Ok(None)
    }

    async fn envelope(&self) -> CoreResult<Vec<Descriptor>> {
        Ok(self
            .entries
            .iter()
            .map(|e| Descriptor::new(e.media_type(), e.digest().clone(), e.size(), None, None))
            .collect())
    }

    async fn has(&self, digest: &Digest) -> bool {
        self.find(digest).is_some()
    }

    async fn get_blob(
        &self,
        digest: &Digest,
        offset: u64,
        length: Option<u64>,
    ) -> CoreResult<BoxStream<'static, CoreResult<Bytes>>> {
        let entry = self
            .find(digest)
            .ok_or_else(|| CoreError::BlobUnknown(digest.clone()))?
            .clone();

        match entry {
            ContentLayerEntry::Inline { data, size, .. } => {
                let start = (offset as usize).min(data.len());
                let end = match length {
                    Some(len) => (start + len as usize).min(data.len()),
                    None => data.len(),
                };
                let _ = size;
                let slice = data.slice(start..end);
                Ok(stream::once(async move { Ok(slice) }).boxed())
            }
            ContentLayerEntry::Remote { url, .. } => {
                let end_header = length.map(|len| offset + len.saturating_sub(1));
                let range = match end_header {
                    Some(end) => format!("bytes={offset}-{end}"),
                    None => format!("bytes={offset}-"),
                };

                let response = self
                    .client
                    .get(url)
                    .header(reqwest::header::RANGE, range)
                    .send()
                    .await?
                    .error_for_status()?;

                Ok(response.bytes_stream().map(|r| r.map_err(CoreError::from)).boxed())
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sha256_digest;
    use futures::TryStreamExt;

    fn inline_entry(bytes: &'static [u8]) -> ContentLayerEntry {
        ContentLayerEntry::Inline {
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
            digest: sha256_digest(bytes),
            size: bytes.len() as u64,
            data: Bytes::from_static(bytes),
        }
    }

    #[tokio::test]
    async fn serves_inline_content_in_full() {
        let entry = inline_entry(b"hello content");
        let source = ContentLayerSource::new(vec![entry.clone()]);

        let digest = entry.digest().clone();
        let stream = source.get_blob(&digest, 0, None).await.unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        let all: Vec<u8> = chunks.into_iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(all, b"hello content");
    }

    #[tokio::test]
    async fn serves_inline_content_range() {
        let entry = inline_entry(b"0123456789");
        let source = ContentLayerSource::new(vec![entry.clone()]);

        let digest = entry.digest().clone();
        let stream = source.get_blob(&digest, 3, Some(4)).await.unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        let all: Vec<u8> = chunks.into_iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(all, b"3456");
    }

    #[tokio::test]
    async fn envelope_preserves_declared_order() {
        let a = inline_entry(b"first");
        let b = inline_entry(b"second-entry");
        let source = ContentLayerSource::new(vec![a.clone(), b.clone()]);

        let envelope = source.envelope().await.unwrap();
        assert_eq!(envelope.len(), 2);
        assert_eq!(envelope[0].get_digest(), a.digest());
        assert_eq!(envelope[1].get_digest(), b.digest());
    }

    #[tokio::test]
    async fn unknown_digest_is_rejected() {
        let entry = inline_entry(b"known");
        let source = ContentLayerSource::new(vec![entry]);

        let bogus = sha256_digest(b"unknown");
        let err = source.get_blob(&bogus, 0, None).await.unwrap_err();
        assert!(matches!(err, CoreError::BlobUnknown(_)));
    }
}
