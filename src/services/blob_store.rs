//! Remote blob storage abstraction.
//!
//! A blob store moves bytes to and from a path-addressed remote filesystem.
//! Every operation opens its own session; nothing is pooled. `get` hands the
//! session to the returned reader so it stays open exactly as long as the
//! caller keeps reading.

use async_trait::async_trait;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Byte stream of a remote object. Dropping it closes the backing session.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Source of bytes for an upload.
pub type BlobSource<'a> = &'a mut (dyn AsyncRead + Send + Unpin);

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob store connection failed: {0}")]
    Connection(String),
    #[error("remote object `{0}` not found")]
    NotFound(String),
    #[error("reading `{path}` failed: {reason}")]
    Read { path: String, reason: String },
    #[error("writing `{path}` failed: {reason}")]
    Write { path: String, reason: String },
    #[error("deleting `{path}` failed: {reason}")]
    Delete { path: String, reason: String },
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Absolute, normalized root under which every blob lives.
    fn root(&self) -> &str;

    /// Open a session and verify the root directory is reachable.
    async fn check(&self) -> Result<(), BlobError>;

    /// Create or truncate `remote_path` and copy all of `source` into it,
    /// creating missing parent directories. Returns bytes written.
    async fn put(&self, source: BlobSource<'_>, remote_path: &str) -> Result<u64, BlobError>;

    /// Open `remote_path` for sequential reading.
    async fn get(&self, remote_path: &str) -> Result<BlobReader, BlobError>;

    /// Remove `remote_path`. A missing object is reported as an error too.
    async fn delete(&self, remote_path: &str) -> Result<(), BlobError>;
}

/// Normalize a configured root: forward slashes, leading slash, no trailing
/// slash (except for `/` itself).
pub fn normalize_root(root: &str) -> String {
    let mut normalized = root.trim().replace('\\', "/");
    if !normalized.starts_with('/') {
        normalized.insert(0, '/');
    }
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Full remote path for `storage_name` under `root`.
pub fn remote_path(root: &str, storage_name: &str) -> String {
    let root = normalize_root(root);
    let name = storage_name.trim_start_matches('/');
    if root == "/" {
        format!("/{name}")
    } else {
        format!("{root}/{name}")
    }
}

/// Parent directory of an absolute remote path (`/` for top-level entries).
pub fn parent_dir(remote_path: &str) -> &str {
    match remote_path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &remote_path[..idx],
    }
}
