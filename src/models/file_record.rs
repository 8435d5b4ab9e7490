//! Represents the metadata of one shared file.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata for a file whose bytes live in the remote blob store.
///
/// The record is written once during upload and never updated. It is removed
/// by the expiry reconciler after `expires_at` has passed.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Name of the blob in remote storage (`{code}{extension}`).
    pub storage_name: String,

    /// Display name supplied by the uploader.
    pub original_name: String,

    /// Public short code. Unique across the table.
    pub code: String,

    /// Content type declared by the uploader.
    pub mime_type: String,

    /// Size in bytes of the stored blob.
    pub size: i64,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the file stops being downloadable.
    pub expires_at: DateTime<Utc>,
}

impl FileRecord {
    /// Build a fresh record stamped at `now`, expiring after `retention`.
    pub fn new(
        code: String,
        storage_name: String,
        original_name: String,
        mime_type: String,
        size: i64,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            storage_name,
            original_name,
            code,
            mime_type,
            size,
            created_at: now,
            expires_at: now + retention,
        }
    }

    /// True once `now` is strictly past the expiry instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
