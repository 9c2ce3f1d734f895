//! The file layer source (§4.C): wraps a single local gzip'd tar layer already sitting on disk.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};

use crate::{
    error::{CoreError, CoreResult},
    model::Descriptor,
};

use super::{ImageEnvelope, LayerSource, SourceKind};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A layer source backed by a single local file. Its digest, size, and media type are computed
/// once at construction by hashing the file in full, so later use is cheap.
pub struct FileLayerSource {
    path: std::path::PathBuf,
    descriptor: Descriptor,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FileLayerSource {
    /// Opens `path`, hashes it in full to derive its descriptor, and returns a source ready to
    /// serve it as a layer with the given media type.
    pub async fn open(path: impl Into<std::path::PathBuf>, media_type: impl Into<String>) -> CoreResult<Self> {
        let path = path.into();
        let mut file = File::open(&path).await?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            size += read as u64;
        }

        let digest: Digest = format!("sha256:{}", hex::encode(hasher.finalize()))
            .parse()
            .expect("sha256 hex digest is always a valid Digest");

        let descriptor = Descriptor::new(media_type, digest, size, None, None);

        Ok(Self { path, descriptor })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl LayerSource for FileLayerSource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    async fn get_image_spec(&self) -> CoreResult<Option<ImageEnvelope>> {
        Ok(None)
    }

    async fn envelope(&self) -> CoreResult<Vec<Descriptor>> {
        Ok(vec![self.descriptor.clone()])
    }

    async fn has(&self, digest: &Digest) -> bool {
        self.descriptor.get_digest() == digest
    }

    async fn get_blob(
        &self,
        digest: &Digest,
        offset: u64,
        length: Option<u64>,
    ) -> CoreResult<BoxStream<'static, CoreResult<Bytes>>> {
        if self.descriptor.get_digest() != digest {
            return Err(CoreError::BlobUnknown(digest.clone()));
        }

        let size = *self.descriptor.get_size();
        if offset > size {
            return Err(CoreError::RangeUnsatisfiable(offset, length, size));
        }
        let end = match length {
            Some(len) => (offset + len).min(size),
            None => size,
        };

        let mut file = File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let to_read = (end - offset) as usize;
        let mut buf = vec![0u8; to_read];
        file.read_exact(&mut buf).await?;

        Ok(stream::once(async move { Ok(Bytes::from(buf)) }).boxed())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn opens_and_hashes_file_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("layer.tar.gz");
        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(b"layer bytes").await.unwrap();
        file.flush().await.unwrap();

        let source = FileLayerSource::open(&path, "application/vnd.oci.image.layer.v1.tar+gzip")
            .await
            .unwrap();

        let envelope = source.envelope().await.unwrap();
        assert_eq!(envelope.len(), 1);
        assert_eq!(*envelope[0].get_size(), 11);
        assert!(source.has(envelope[0].get_digest()).await);
    }

    #[tokio::test]
    async fn streams_full_blob_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("layer.tar.gz");
        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(b"0123456789").await.unwrap();
        file.flush().await.unwrap();

        let source = FileLayerSource::open(&path, "application/vnd.oci.image.layer.v1.tar+gzip")
            .await
            .unwrap();
        let digest = source.descriptor.get_digest().clone();

        let stream = source.get_blob(&digest, 0, None).await.unwrap();
        let bytes: Vec<Bytes> = stream.try_collect().await.unwrap();
        let all: Vec<u8> = bytes.into_iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(all, b"0123456789");
    }

    #[tokio::test]
    async fn streams_partial_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("layer.tar.gz");
        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(b"0123456789").await.unwrap();
        file.flush().await.unwrap();

        let source = FileLayerSource::open(&path, "application/vnd.oci.image.layer.v1.tar+gzip")
            .await
            .unwrap();
        let digest = source.descriptor.get_digest().clone();

        let stream = source.get_blob(&digest, 2, Some(3)).await.unwrap();
        let bytes: Vec<Bytes> = stream.try_collect().await.unwrap();
        let all: Vec<u8> = bytes.into_iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(all, b"234");
    }
}
