//! Expiry reconciler.
//!
//! One pass scans the metadata store for records past their expiry and, for
//! each, deletes the blob and then the metadata record. Records are handled
//! independently: a failure on one is logged and the pass moves on. A record
//! counts as reconciled only when both deletions succeed.

use crate::models::file_record::FileRecord;
use crate::services::{
    blob_store::{BlobStore, remote_path},
    metadata_store::MetadataStore,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct Reconciler {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
}

impl Reconciler {
    pub fn new(blobs: Arc<dyn BlobStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { blobs, metadata }
    }

    /// Run one pass against the current time. Returns the number of records
    /// removed from both stores.
    pub async fn run(&self) -> usize {
        self.run_at(Utc::now()).await
    }

    /// Every record is carried through both deletes; each store call is
    /// bounded by that store's own timeout, never by a pass deadline.
    pub async fn run_at(&self, now: DateTime<Utc>) -> usize {
        let deleted = self.sweep(now).await;
        info!(deleted, "reconciliation pass finished");
        deleted
    }

    async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut deleted = 0usize;
        let mut expired = self.metadata.find_expired_before(now);
        let mut examined = 0usize;

        while let Some(next) = expired.next().await {
            let record = match next {
                Ok(record) => record,
                Err(err) => {
                    error!(error = %err, "scanning expired records failed; ending pass");
                    break;
                }
            };
            examined += 1;
            if self.reconcile(&record).await {
                deleted += 1;
            }
        }

        debug!(examined, "expired records examined");
        deleted
    }

    /// Blob first, then metadata. The metadata delete runs even when the blob
    /// delete failed.
    async fn reconcile(&self, record: &FileRecord) -> bool {
        let path = remote_path(self.blobs.root(), &record.storage_name);

        let blob_ok = match self.blobs.delete(&path).await {
            Ok(()) => true,
            Err(err) => {
                warn!(code = %record.code, %path, error = %err, "failed to delete expired blob");
                false
            }
        };

        let meta_ok = match self.metadata.delete_by_id(record.id).await {
            Ok(()) => true,
            Err(err) => {
                warn!(code = %record.code, id = %record.id, error = %err, "failed to delete expired record");
                false
            }
        };

        if blob_ok && meta_ok {
            debug!(code = %record.code, "expired file removed");
        }
        blob_ok && meta_ok
    }
}
