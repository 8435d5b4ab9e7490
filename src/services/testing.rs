//! Stubs shared by the service tests.

use crate::models::file_record::FileRecord;
use crate::services::{
    blob_store::{BlobError, BlobReader, BlobSource, BlobStore},
    code_generator::{CodeError, CodeGenerator},
    memory_blob_store::MemoryBlobStore,
    metadata_store::{MetadataStore, StoreError, StoreResult},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use uuid::Uuid;

/// Hands out queued codes, then repeats `fallback` forever.
pub struct ScriptedCodes {
    queue: Mutex<VecDeque<String>>,
    fallback: String,
    calls: AtomicUsize,
}

impl ScriptedCodes {
    pub fn new(queue: &[&str], fallback: &str) -> Self {
        Self {
            queue: Mutex::new(queue.iter().map(|c| c.to_string()).collect()),
            fallback: fallback.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(code: &str) -> Self {
        Self::new(&[], code)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CodeGenerator for ScriptedCodes {
    fn generate(&self) -> Result<String, CodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.queue.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Generator whose entropy source is gone.
pub struct BrokenEntropy;

impl CodeGenerator for BrokenEntropy {
    fn generate(&self) -> Result<String, CodeError> {
        Err(CodeError::Entropy("device not configured".into()))
    }
}

/// Memory blob store with switchable failures.
pub struct FlakyBlobs {
    pub inner: MemoryBlobStore,
    pub fail_put: AtomicBool,
    pub fail_delete: AtomicBool,
    /// Milliseconds a failing delete stalls before it reports the failure.
    pub delete_stall_ms: AtomicU64,
}

impl FlakyBlobs {
    pub fn new(root: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBlobStore::new(root),
            fail_put: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            delete_stall_ms: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl BlobStore for FlakyBlobs {
    fn root(&self) -> &str {
        self.inner.root()
    }

    async fn check(&self) -> Result<(), BlobError> {
        self.inner.check().await
    }

    async fn put(&self, source: BlobSource<'_>, remote_path: &str) -> Result<u64, BlobError> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(BlobError::Connection("connection refused".into()));
        }
        self.inner.put(source, remote_path).await
    }

    async fn get(&self, remote_path: &str) -> Result<BlobReader, BlobError> {
        self.inner.get(remote_path).await
    }

    async fn delete(&self, remote_path: &str) -> Result<(), BlobError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            let stall = self.delete_stall_ms.load(Ordering::SeqCst);
            if stall > 0 {
                tokio::time::sleep(Duration::from_millis(stall)).await;
            }
            return Err(BlobError::Delete {
                path: remote_path.to_string(),
                reason: "permission denied".into(),
            });
        }
        self.inner.delete(remote_path).await
    }
}

/// Wraps a metadata store; can hide existing codes from lookups (simulating a
/// concurrent upload that has not committed yet) and fail deletes.
pub struct FlakyMetadata<M> {
    pub inner: M,
    pub hide_lookups: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl<M: MetadataStore> FlakyMetadata<M> {
    pub fn new(inner: M) -> Arc<Self> {
        Arc::new(Self {
            inner,
            hide_lookups: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl<M: MetadataStore> MetadataStore for FlakyMetadata<M> {
    async fn insert(&self, record: &FileRecord) -> StoreResult<()> {
        self.inner.insert(record).await
    }

    async fn find_by_code(&self, code: &str) -> StoreResult<FileRecord> {
        if self.hide_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::NotFound(code.to_string()));
        }
        self.inner.find_by_code(code).await
    }

    fn find_expired_before(
        &self,
        instant: DateTime<Utc>,
    ) -> BoxStream<'_, StoreResult<FileRecord>> {
        self.inner.find_expired_before(instant)
    }

    async fn delete_by_id(&self, id: Uuid) -> StoreResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout(std::time::Duration::from_secs(5)));
        }
        self.inner.delete_by_id(id).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }
}
