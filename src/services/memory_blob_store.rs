//! In-process blob store.
//!
//! Holds blobs in a [`DashMap`] keyed by remote path. Used for local
//! development (`--blob-backend memory`) and in tests. Follows the same path
//! policy as the SFTP backend.

use crate::services::blob_store::{
    BlobError, BlobReader, BlobSource, BlobStore, normalize_root, parent_dir,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::Cursor;
use tokio::io::AsyncReadExt;

#[derive(Debug)]
pub struct MemoryBlobStore {
    root: String,
    blobs: DashMap<String, Bytes>,
}

impl MemoryBlobStore {
    pub fn new(root: &str) -> Self {
        Self {
            root: normalize_root(root),
            blobs: DashMap::new(),
        }
    }

    /// Whether a blob is stored at `remote_path`.
    pub fn contains(&self, remote_path: &str) -> bool {
        self.blobs.contains_key(remote_path)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn root(&self) -> &str {
        &self.root
    }

    async fn check(&self) -> Result<(), BlobError> {
        if self.blobs.contains_key(&self.root) {
            return Err(BlobError::Connection(format!(
                "root `{}` is not a directory",
                self.root
            )));
        }
        Ok(())
    }

    async fn put(&self, source: BlobSource<'_>, remote_path: &str) -> Result<u64, BlobError> {
        let parent = parent_dir(remote_path);
        if self.blobs.contains_key(parent) {
            return Err(BlobError::Write {
                path: remote_path.to_string(),
                reason: format!("path exists but is not a directory: {parent}"),
            });
        }

        let mut buf = Vec::new();
        let written = source
            .read_to_end(&mut buf)
            .await
            .map_err(|err| BlobError::Write {
                path: remote_path.to_string(),
                reason: err.to_string(),
            })?;

        self.blobs.insert(remote_path.to_string(), Bytes::from(buf));
        Ok(written as u64)
    }

    async fn get(&self, remote_path: &str) -> Result<BlobReader, BlobError> {
        let bytes = self
            .blobs
            .get(remote_path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BlobError::NotFound(remote_path.to_string()))?;
        Ok(Box::pin(Cursor::new(bytes)))
    }

    async fn delete(&self, remote_path: &str) -> Result<(), BlobError> {
        self.blobs
            .remove(remote_path)
            .map(|_| ())
            .ok_or_else(|| BlobError::Delete {
                path: remote_path.to_string(),
                reason: "no such file".into(),
            })
    }
}
