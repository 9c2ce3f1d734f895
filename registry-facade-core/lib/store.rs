//! Content-addressed local blob store (§4.A).
//!
//! Blobs live at `<root>/<algorithm>/<hex>`. Writers stage their bytes under
//! `<root>/ingest/<uuid>` and are only renamed into place once the computed digest has been
//! verified, so a reader never observes a partially-written blob.

use std::{
    collections::HashMap,
    ops::Range,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
};

use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex as AsyncMutex,
};

use crate::error::{CoreError, CoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A content-addressed store of blobs on the local filesystem.
#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
    commit_locks: Arc<StdMutex<HashMap<Digest, Arc<AsyncMutex<()>>>>>,
}

/// A staged, in-progress write to the store. Bytes are hashed as they are written and the
/// staged file is only committed into the content-addressed layout on [`BlobWriter::commit`].
pub struct BlobWriter {
    store: BlobStore,
    staging_path: PathBuf,
    file: File,
    hasher: Sha256,
    size: u64,
    expected: Option<Digest>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BlobStore {
    /// Opens (creating if necessary) a blob store rooted at `root`.
    pub async fn new(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        fs::create_dir_all(root.join("ingest")).await?;

        Ok(Self {
            root,
            commit_locks: Arc::new(StdMutex::new(HashMap::new())),
        })
    }

    /// Returns the path a blob with the given digest would be stored at.
    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.algorithm().to_string()).join(digest.digest())
    }

    /// Returns `true` if a blob with the given digest is present.
    pub fn has(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Returns the size of a stored blob, if present.
    pub async fn size(&self, digest: &Digest) -> CoreResult<Option<u64>> {
        let path = self.blob_path(digest);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Opens a stored blob for reading, starting at byte 0.
    pub async fn open(&self, digest: &Digest) -> CoreResult<File> {
        let path = self.blob_path(digest);
        File::open(&path)
            .await
            .map_err(|_| CoreError::BlobUnknown(digest.clone()))
    }

    /// Reads a byte range `[range.start, range.end)` of a stored blob into memory.
    ///
    /// Used for the common case of modestly-sized range requests; large ranges should stream
    /// via [`BlobStore::open`] plus a seek instead.
    pub async fn read_range(&self, digest: &Digest, range: Range<u64>) -> CoreResult<Vec<u8>> {
        let size = self
            .size(digest)
            .await?
            .ok_or_else(|| CoreError::BlobUnknown(digest.clone()))?;

        if range.start > size || range.end > size || range.start > range.end {
            return Err(CoreError::RangeUnsatisfiable(
                range.start,
                Some(range.end),
                size,
            ));
        }

        let mut file = self.open(digest).await?;
        file.seek(std::io::SeekFrom::Start(range.start)).await?;

        let len = (range.end - range.start) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Begins a new staged write. If `expected` is provided, [`BlobWriter::commit`] verifies
    /// the computed digest matches before renaming into place.
    pub async fn writer(&self, expected: Option<Digest>) -> CoreResult<BlobWriter> {
        let staging_path = self.root.join("ingest").join(uuid::Uuid::new_v4().to_string());
        let file = File::create(&staging_path).await?;

        Ok(BlobWriter {
            store: self.clone(),
            staging_path,
            file,
            hasher: Sha256::new(),
            size: 0,
            expected,
        })
    }

    /// Returns (creating if absent) the per-digest commit lock, serializing concurrent writers
    /// racing to commit the same digest.
    fn commit_lock(&self, digest: &Digest) -> Arc<AsyncMutex<()>> {
        let mut locks = self.commit_locks.lock().expect("commit lock poisoned");
        locks
            .entry(digest.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

impl BlobWriter {
    /// Appends bytes to the staged write, updating the running digest.
    pub async fn write_all(&mut self, bytes: &[u8]) -> CoreResult<()> {
        self.file.write_all(bytes).await?;
        self.hasher.update(bytes);
        self.size += bytes.len() as u64;
        Ok(())
    }

    /// Verifies the computed digest (against `expected`, if supplied) and atomically commits
    /// the staged bytes into the content-addressed layout. Returns the committed digest and
    /// size. On digest mismatch, the staged file is discarded and an error is returned.
    pub async fn commit(mut self) -> CoreResult<(Digest, u64)> {
        self.file.flush().await?;
        drop(self.file);

        let computed: Digest = format!("sha256:{}", hex::encode(self.hasher.finalize()))
            .parse()
            .map_err(|_| CoreError::custom(anyhow::anyhow!("failed to format computed digest")))?;

        if let Some(expected) = &self.expected
            && expected != &computed
        {
            let _ = fs::remove_file(&self.staging_path).await;
            return Err(CoreError::DigestMismatch {
                expected: expected.clone(),
                actual: computed,
            });
        }

        let lock = self.store.commit_lock(&computed);
        let _guard = lock.lock().await;

        let dest = self.store.blob_path(&computed);
        if dest.exists() {
            // Another writer already committed this digest; discard ours.
            let _ = fs::remove_file(&self.staging_path).await;
            return Ok((computed, self.size));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&self.staging_path, &dest).await?;

        Ok((computed, self.size))
    }

    /// Discards the staged write without committing it.
    pub async fn abort(self) {
        let _ = fs::remove_file(&self.staging_path).await;
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path()).await.unwrap();

        let mut writer = store.writer(None).await.unwrap();
        writer.write_all(b"hello world").await.unwrap();
        let (digest, size) = writer.commit().await.unwrap();

        assert_eq!(size, 11);
        assert!(store.has(&digest));

        let bytes = store.read_range(&digest, 0..size).await.unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[tokio::test]
    async fn commit_rejects_digest_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path()).await.unwrap();

        let bogus: Digest = format!("sha256:{}", "0".repeat(64)).parse().unwrap();
        let mut writer = store.writer(Some(bogus)).await.unwrap();
        writer.write_all(b"not matching").await.unwrap();

        let err = writer.commit().await.unwrap_err();
        assert!(matches!(err, CoreError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn range_read_returns_requested_slice() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path()).await.unwrap();

        let mut writer = store.writer(None).await.unwrap();
        writer.write_all(b"0123456789").await.unwrap();
        let (digest, _) = writer.commit().await.unwrap();

        let bytes = store.read_range(&digest, 2..5).await.unwrap();
        assert_eq!(bytes, b"234");
    }

    #[tokio::test]
    async fn range_read_rejects_out_of_bounds() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path()).await.unwrap();

        let mut writer = store.writer(None).await.unwrap();
        writer.write_all(b"short").await.unwrap();
        let (digest, _) = writer.commit().await.unwrap();

        let err = store.read_range(&digest, 0..100).await.unwrap_err();
        assert!(matches!(err, CoreError::RangeUnsatisfiable(..)));
    }

    #[tokio::test]
    async fn concurrent_commits_of_same_digest_converge() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path()).await.unwrap();

        let mut w1 = store.writer(None).await.unwrap();
        w1.write_all(b"same bytes").await.unwrap();
        let mut w2 = store.writer(None).await.unwrap();
        w2.write_all(b"same bytes").await.unwrap();

        let (d1, _) = w1.commit().await.unwrap();
        let (d2, _) = w2.commit().await.unwrap();

        assert_eq!(d1, d2);
        assert!(store.has(&d1));
    }
}
