//! Metadata persistence for [`FileRecord`]s.
//!
//! The `files` table carries a unique index on `code`; that constraint is the
//! only thing standing between two uploads that drew the same code. Every
//! call is bounded by a short timeout.

use crate::models::file_record::FileRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use sqlx::SqlitePool;
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Rows fetched per page while scanning for expired records.
const EXPIRED_PAGE_SIZE: i64 = 100;

const SELECT_BY_CODE: &str = "SELECT id, storage_name, original_name, code, mime_type, size,
        created_at, expires_at
 FROM files WHERE code = ?";

const SELECT_EXPIRED_FIRST_PAGE: &str = "SELECT id, storage_name, original_name, code, mime_type,
        size, created_at, expires_at
 FROM files
 WHERE expires_at < ?
 ORDER BY expires_at ASC, id ASC LIMIT ?";

const SELECT_EXPIRED_NEXT_PAGE: &str = "SELECT id, storage_name, original_name, code, mime_type,
        size, created_at, expires_at
 FROM files
 WHERE expires_at < ?
   AND (expires_at > ? OR (expires_at = ? AND id > ?))
 ORDER BY expires_at ASC, id ASC LIMIT ?";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("code `{0}` already exists")]
    DuplicateCode(String),
    #[error("no record for code `{0}`")]
    NotFound(String),
    #[error("metadata operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new record. Fails with [`StoreError::DuplicateCode`] when the
    /// code is taken.
    async fn insert(&self, record: &FileRecord) -> StoreResult<()>;

    async fn find_by_code(&self, code: &str) -> StoreResult<FileRecord>;

    /// One-shot lazy scan of records with `expires_at < instant`.
    fn find_expired_before(
        &self,
        instant: DateTime<Utc>,
    ) -> BoxStream<'_, StoreResult<FileRecord>>;

    async fn delete_by_id(&self, id: Uuid) -> StoreResult<()>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> StoreResult<()>;
}

/// SQLite implementation of [`MetadataStore`].
#[derive(Clone)]
pub struct SqliteMetadataStore {
    db: Arc<SqlitePool>,
    op_timeout: Duration,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>, op_timeout: Duration) -> Self {
        Self { db, op_timeout }
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.op_timeout)))
    }

    async fn fetch_expired_page(
        &self,
        instant: DateTime<Utc>,
        after: Option<(DateTime<Utc>, Uuid)>,
    ) -> StoreResult<Vec<FileRecord>> {
        let query = match after {
            None => sqlx::query_as::<_, FileRecord>(SELECT_EXPIRED_FIRST_PAGE)
                .bind(instant)
                .bind(EXPIRED_PAGE_SIZE),
            Some((last_expiry, last_id)) => {
                sqlx::query_as::<_, FileRecord>(SELECT_EXPIRED_NEXT_PAGE)
                    .bind(instant)
                    .bind(last_expiry)
                    .bind(last_expiry)
                    .bind(last_id)
                    .bind(EXPIRED_PAGE_SIZE)
            }
        };

        self.bounded(async { Ok(query.fetch_all(&*self.db).await?) })
            .await
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn insert(&self, record: &FileRecord) -> StoreResult<()> {
        let result = self
            .bounded(async {
                sqlx::query(
                    "INSERT INTO files (
                        id, storage_name, original_name, code, mime_type, size,
                        created_at, expires_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(record.id)
                .bind(&record.storage_name)
                .bind(&record.original_name)
                .bind(&record.code)
                .bind(&record.mime_type)
                .bind(record.size)
                .bind(record.created_at)
                .bind(record.expires_at)
                .execute(&*self.db)
                .await
                .map_err(StoreError::from)
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(StoreError::Sqlx(err)) if is_unique_violation(&err) => {
                Err(StoreError::DuplicateCode(record.code.clone()))
            }
            Err(err) => Err(err),
        }
    }

    async fn find_by_code(&self, code: &str) -> StoreResult<FileRecord> {
        self.bounded(async {
            sqlx::query_as::<_, FileRecord>(SELECT_BY_CODE)
                .bind(code)
                .fetch_one(&*self.db)
                .await
                .map_err(|err| match err {
                    sqlx::Error::RowNotFound => StoreError::NotFound(code.to_string()),
                    other => StoreError::Sqlx(other),
                })
        })
        .await
    }

    fn find_expired_before(
        &self,
        instant: DateTime<Utc>,
    ) -> BoxStream<'_, StoreResult<FileRecord>> {
        // Keyset pagination on (expires_at, id); no connection is held between pages.
        let pages = futures::stream::try_unfold(Some(None), move |cursor| async move {
            let Some(after) = cursor else {
                return Ok::<_, StoreError>(None);
            };
            let page = self.fetch_expired_page(instant, after).await?;
            debug!("expired scan fetched {} records", page.len());

            let next = if (page.len() as i64) < EXPIRED_PAGE_SIZE {
                None
            } else {
                page.last().map(|last| Some((last.expires_at, last.id)))
            };
            if page.is_empty() {
                return Ok(None);
            }
            let items = futures::stream::iter(page.into_iter().map(Ok::<_, StoreError>));
            Ok(Some((items, next)))
        });

        pages.try_flatten().boxed()
    }

    async fn delete_by_id(&self, id: Uuid) -> StoreResult<()> {
        self.bounded(async {
            sqlx::query("DELETE FROM files WHERE id = ?")
                .bind(id)
                .execute(&*self.db)
                .await?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.bounded(async {
            sqlx::query_scalar::<_, i64>("SELECT 1")
                .fetch_one(&*self.db)
                .await?;
            Ok(())
        })
        .await
    }
}

/// Apply the embedded schema. Statements are idempotent.
pub async fn run_migrations(db: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = MIGRATION_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err.is_unique_violation()
                || db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Single-connection in-memory database with the schema applied.
    pub(crate) async fn memory_pool() -> Arc<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        Arc::new(pool)
    }

    pub(crate) async fn memory_store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(memory_pool().await, Duration::from_secs(5))
    }

    pub(crate) fn record(code: &str, expires_at: DateTime<Utc>) -> FileRecord {
        FileRecord {
            id: Uuid::new_v4(),
            storage_name: format!("{code}.bin"),
            original_name: "blob.bin".into(),
            code: code.into(),
            mime_type: "application/octet-stream".into(),
            size: 3,
            created_at: expires_at - ChronoDuration::days(7),
            expires_at,
        }
    }

    #[tokio::test]
    async fn insert_then_find_by_code() {
        let store = memory_store().await;
        let rec = record("abc123", Utc::now() + ChronoDuration::days(1));
        store.insert(&rec).await.unwrap();

        let found = store.find_by_code("abc123").await.unwrap();
        assert_eq!(found.id, rec.id);
        assert_eq!(found.original_name, rec.original_name);
        assert_eq!(found.expires_at, rec.expires_at);
    }

    #[tokio::test]
    async fn missing_code_is_not_found() {
        let store = memory_store().await;
        assert!(matches!(
            store.find_by_code("nope00").await,
            Err(StoreError::NotFound(code)) if code == "nope00"
        ));
    }

    #[tokio::test]
    async fn duplicate_code_is_rejected() {
        let store = memory_store().await;
        let expires = Utc::now() + ChronoDuration::days(1);
        store.insert(&record("dup001", expires)).await.unwrap();

        let err = store.insert(&record("dup001", expires)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateCode(code) if code == "dup001"));
    }

    #[tokio::test]
    async fn expired_scan_returns_only_past_records() {
        let store = memory_store().await;
        let now = Utc::now();
        store.insert(&record("old001", now - ChronoDuration::days(2))).await.unwrap();
        store.insert(&record("old002", now - ChronoDuration::hours(1))).await.unwrap();
        store.insert(&record("new001", now + ChronoDuration::days(1))).await.unwrap();

        let mut codes: Vec<String> = store
            .find_expired_before(now)
            .map_ok(|r| r.code)
            .try_collect()
            .await
            .unwrap();
        codes.sort();
        assert_eq!(codes, vec!["old001", "old002"]);
    }

    #[tokio::test]
    async fn expired_scan_pages_through_many_records_while_deleting() {
        let store = memory_store().await;
        let now = Utc::now();
        let base = now - ChronoDuration::days(1);
        for i in 0..(EXPIRED_PAGE_SIZE * 2 + 5) {
            // Pairs share an expiry so the id tiebreak is exercised.
            let expires = base + ChronoDuration::seconds(i / 2);
            store.insert(&record(&format!("c{i:05}"), expires)).await.unwrap();
        }

        let mut scan = store.find_expired_before(now);
        let mut seen = 0;
        while let Some(rec) = scan.next().await {
            store.delete_by_id(rec.unwrap().id).await.unwrap();
            seen += 1;
        }
        assert_eq!(seen, EXPIRED_PAGE_SIZE * 2 + 5);
        assert_eq!(store.find_expired_before(now).count().await, 0);
    }

    #[tokio::test]
    async fn delete_by_id_removes_record() {
        let store = memory_store().await;
        let rec = record("del001", Utc::now());
        store.insert(&rec).await.unwrap();
        store.delete_by_id(rec.id).await.unwrap();
        assert!(matches!(
            store.find_by_code("del001").await,
            Err(StoreError::NotFound(_))
        ));
        store.ping().await.unwrap();
    }
}
