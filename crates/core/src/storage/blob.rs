use crate::types::BlobHash;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Content-addressed storage for artifact content
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob and return its content hash
    async fn put(&self, data: Bytes) -> Result<BlobHash>;

    /// Retrieve a blob by its content hash
    async fn get(&self, hash: &BlobHash) -> Result<Option<Bytes>>;

    /// Store the content of a file, if it exists
    async fn put_file(&self, path: &Path) -> Result<Option<BlobHash>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(self.put(Bytes::from(data)).await?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}

/// Filesystem-based blob store
#[derive(Clone)]
pub struct FilesystemBlobStore {
    base_path: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create blob store directory")?;
        Ok(Self { base_path })
    }

    // blobs/ab/abcdef123...
    fn blob_path(&self, hash: &BlobHash) -> PathBuf {
        let prefix = &hash.0[..2];
        self.base_path.join(prefix).join(&hash.0)
    }
}

#[async_trait::async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, data: Bytes) -> Result<BlobHash> {
        let hash = BlobHash::from_bytes(&data);
        let path = self.blob_path(&hash);
        if path.exists() {
            return Ok(hash);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create blob directory")?;
        }

        // Write under a temporary name so readers never see a partial blob
        let tmp_path = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .context("Failed to create blob file")?;
        file.write_all(&data).await.context("Failed to write blob")?;
        file.sync_all().await.context("Failed to sync blob")?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .context("Failed to move blob into place")?;

        Ok(hash)
    }

    async fn get(&self, hash: &BlobHash) -> Result<Option<Bytes>> {
        let path = self.blob_path(hash);
        if !path.exists() {
            return Ok(None);
        }

        let data = tokio::fs::read(&path).await.context("Failed to read blob")?;
        Ok(Some(Bytes::from(data)))
    }
}
