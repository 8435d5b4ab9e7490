//! FileService: upload and download of shared files.
//!
//! An upload is buffered to an anonymous temp file, written to the blob store
//! under a freshly generated code, and only then recorded in the metadata
//! store. A download resolves the code, refuses expired records, and opens
//! the blob for streaming. Neither path deletes anything; expiry cleanup is
//! the reconciler's job.

use crate::models::file_record::FileRecord;
use crate::services::{
    blob_store::{BlobError, BlobReader, BlobStore, remote_path},
    code_generator::{CodeError, CodeGenerator},
    metadata_store::{MetadataStore, StoreError},
};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, SeekFrom},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, info, warn};

/// Attempts at finding an unused code before giving up.
pub const DEFAULT_MAX_CODE_ATTEMPTS: usize = 5;

/// Longest extension carried over from the original name (dot included).
const MAX_EXTENSION_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("{0}")]
    Validation(String),
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("file `{0}` has expired")]
    Expired(String),
    #[error("retrieving blob for `{code}` failed: {source}")]
    Retrieval { code: String, source: BlobError },
    #[error("no unused code found after {0} attempts")]
    CodesExhausted(usize),
    #[error(transparent)]
    Code(#[from] CodeError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("buffering upload failed: {0}")]
    Buffer(#[from] io::Error),
}

pub type ShareResult<T> = Result<T, ShareError>;

/// Tunables for the upload path.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub retention: Duration,
    pub base_url: String,
    pub max_code_attempts: usize,
}

/// Result of a successful upload.
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub code: String,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
    pub record: FileRecord,
}

/// An open download: the record plus a reader over the blob bytes.
pub struct Download {
    pub record: FileRecord,
    pub reader: BlobReader,
}

#[derive(Clone)]
pub struct FileService {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    codes: Arc<dyn CodeGenerator>,
    settings: Arc<LifecycleSettings>,
}

impl FileService {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        codes: Arc<dyn CodeGenerator>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            blobs,
            metadata,
            codes,
            settings: Arc::new(settings),
        }
    }

    /// Public link for a code.
    pub fn download_url(&self, code: &str) -> String {
        format!(
            "{}/download/{}",
            self.settings.base_url.trim_end_matches('/'),
            code
        )
    }

    /// Buffer `stream` locally, then store it under a new code.
    pub async fn upload_stream<S>(
        &self,
        stream: S,
        original_name: &str,
        mime_type: &str,
    ) -> ShareResult<UploadReceipt>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let original_name = original_name.trim();
        if original_name.is_empty() {
            return Err(ShareError::Validation("No file provided".into()));
        }

        // Anonymous temp file: unlinked on creation, gone once dropped.
        let (mut buffer, buffered_len) = buffer_to_tempfile(stream).await?;
        debug!(name = %original_name, bytes = buffered_len, "upload buffered");

        self.store_buffered(&mut buffer, buffered_len, original_name, mime_type)
            .await
    }

    async fn store_buffered(
        &self,
        buffer: &mut File,
        buffered_len: u64,
        original_name: &str,
        mime_type: &str,
    ) -> ShareResult<UploadReceipt> {
        let attempts = self.settings.max_code_attempts.max(1);

        for attempt in 1..=attempts {
            let code = self.codes.generate()?;

            // Skip codes already on record so their blobs are never overwritten.
            match self.metadata.find_by_code(&code).await {
                Ok(_) => {
                    debug!(%code, attempt, "generated code already in use");
                    continue;
                }
                Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }

            let storage_name = storage_name(&code, original_name);
            let path = remote_path(self.blobs.root(), &storage_name);

            buffer.seek(SeekFrom::Start(0)).await?;
            let written = self.blobs.put(&mut *buffer, &path).await?;
            if written != buffered_len {
                return Err(ShareError::Blob(BlobError::Write {
                    path,
                    reason: format!("wrote {written} of {buffered_len} bytes"),
                }));
            }

            let record = FileRecord::new(
                code.clone(),
                storage_name,
                original_name.to_string(),
                mime_type.to_string(),
                written as i64,
                Utc::now(),
                self.settings.retention,
            );

            match self.metadata.insert(&record).await {
                Ok(()) => {
                    info!(%code, %path, size = written, "file uploaded");
                    return Ok(UploadReceipt {
                        download_url: self.download_url(&code),
                        expires_at: record.expires_at,
                        code,
                        record,
                    });
                }
                Err(StoreError::DuplicateCode(_)) => {
                    warn!(%code, attempt, "code collided on insert, regenerating");
                }
                Err(err) => {
                    warn!(%code, %path, "metadata insert failed after blob write; blob orphaned");
                    return Err(err.into());
                }
            }
        }

        Err(ShareError::CodesExhausted(attempts))
    }

    /// Resolve `code` and open its blob.
    pub async fn download(&self, code: &str) -> ShareResult<Download> {
        self.download_at(code, Utc::now()).await
    }

    /// Same as [`download`](Self::download) with an explicit clock.
    pub async fn download_at(&self, code: &str, now: DateTime<Utc>) -> ShareResult<Download> {
        if code.is_empty() || !code.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ShareError::NotFound(code.to_string()));
        }

        let record = match self.metadata.find_by_code(code).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => return Err(ShareError::NotFound(code.to_string())),
            Err(err) => return Err(err.into()),
        };

        if record.is_expired_at(now) {
            info!(%code, expires_at = %record.expires_at, "download refused: expired");
            return Err(ShareError::Expired(code.to_string()));
        }

        let path = remote_path(self.blobs.root(), &record.storage_name);
        debug!(%code, %path, "opening blob for download");
        let reader = self
            .blobs
            .get(&path)
            .await
            .map_err(|source| ShareError::Retrieval {
                code: code.to_string(),
                source,
            })?;

        Ok(Download { record, reader })
    }
}

/// Copy `stream` into an anonymous temp file. Returns the file and its length.
async fn buffer_to_tempfile<S>(stream: S) -> io::Result<(File, u64)>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let std_file = tokio::task::spawn_blocking(tempfile::tempfile)
        .await
        .map_err(io::Error::other)??;
    let mut file = File::from_std(std_file);

    let mut len: u64 = 0;
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        len += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok((file, len))
}

/// Remote name for a blob: the code plus the original extension.
pub fn storage_name(code: &str, original_name: &str) -> String {
    format!("{code}{}", extension_of(original_name))
}

/// Extension of the last path component, dot included. Extensions that are
/// long or contain anything but ASCII alphanumerics, `-` or `_` are dropped,
/// leaving the bare code as the storage name.
pub fn extension_of(name: &str) -> &str {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let Some(idx) = base.rfind('.') else {
        return "";
    };
    let ext = &base[idx..];
    if ext.len() > 1
        && ext.len() <= MAX_EXTENSION_LEN
        && ext[1..]
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        ext
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        memory_blob_store::MemoryBlobStore,
        metadata_store::{
            SqliteMetadataStore,
            tests::{memory_store, record},
        },
        testing::{BrokenEntropy, FlakyBlobs, FlakyMetadata, ScriptedCodes},
    };
    use std::sync::atomic::Ordering;
    use tokio::io::AsyncReadExt;

    fn settings() -> LifecycleSettings {
        LifecycleSettings {
            retention: Duration::days(7),
            base_url: "https://share.example/".into(),
            max_code_attempts: DEFAULT_MAX_CODE_ATTEMPTS,
        }
    }

    fn body(bytes: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send {
        futures::stream::iter(
            bytes
                .chunks(4)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect::<Vec<_>>(),
        )
    }

    async fn read_all(mut reader: BlobReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn extensions_follow_last_component() {
        assert_eq!(extension_of("report.pdf"), ".pdf");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("dir.d/README"), "");
        assert_eq!(extension_of("C:\\docs\\a.TXT"), ".TXT");
        assert_eq!(extension_of("noext"), "");
        assert_eq!(extension_of("trailing."), "");
        assert_eq!(extension_of("weird.p df"), "");
        assert_eq!(storage_name("aB3dE9", "photo.jpeg"), "aB3dE9.jpeg");
    }

    #[test]
    fn path_safe_punctuation_is_kept_in_extensions() {
        assert_eq!(storage_name("aB3dE9", "backup.tar_gz"), "aB3dE9.tar_gz");
        assert_eq!(storage_name("aB3dE9", "notes.draft-2"), "aB3dE9.draft-2");
        assert_eq!(
            storage_name("aB3dE9", "a.abcdefghijklmnopqrstuvwxyz01234"),
            "aB3dE9.abcdefghijklmnopqrstuvwxyz01234"
        );
        // Separators and oversized extensions fall back to the bare code.
        assert_eq!(storage_name("aB3dE9", "evil.x;rm"), "aB3dE9");
        assert_eq!(storage_name("aB3dE9", &format!("big.{}", "x".repeat(40))), "aB3dE9");
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let blobs = Arc::new(MemoryBlobStore::new("/share"));
        let metadata = Arc::new(memory_store().await);
        let service = FileService::new(
            blobs.clone(),
            metadata,
            Arc::new(ScriptedCodes::always("Xy12Ab")),
            settings(),
        );

        let payload: &'static [u8] = b"the quick brown fox jumps";
        let receipt = service
            .upload_stream(body(payload), "fox.txt", "text/plain")
            .await
            .unwrap();

        assert_eq!(receipt.code, "Xy12Ab");
        assert_eq!(receipt.download_url, "https://share.example/download/Xy12Ab");
        assert!(blobs.contains("/share/Xy12Ab.txt"));
        assert_eq!(
            receipt.record.expires_at - receipt.record.created_at,
            Duration::days(7)
        );

        let download = service.download(&receipt.code).await.unwrap();
        assert_eq!(download.record.original_name, "fox.txt");
        assert_eq!(download.record.mime_type, "text/plain");
        assert_eq!(download.record.size, payload.len() as i64);
        assert_eq!(read_all(download.reader).await, payload);
    }

    #[tokio::test]
    async fn blank_name_is_a_validation_error() {
        let service = FileService::new(
            Arc::new(MemoryBlobStore::new("/share")),
            Arc::new(memory_store().await),
            Arc::new(ScriptedCodes::always("Xy12Ab")),
            settings(),
        );
        let err = service
            .upload_stream(body(b"x"), "  ", "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::Validation(_)));
    }

    #[tokio::test]
    async fn colliding_code_is_regenerated() {
        let blobs = Arc::new(MemoryBlobStore::new("/share"));
        let metadata = Arc::new(memory_store().await);
        let codes = Arc::new(ScriptedCodes::new(&["AAAAAA", "AAAAAA"], "BBBBBB"));
        let service = FileService::new(blobs.clone(), metadata, codes.clone(), settings());

        let first = service.upload_stream(body(b"one"), "a.txt", "text/plain").await.unwrap();
        let second = service.upload_stream(body(b"two"), "b.txt", "text/plain").await.unwrap();

        assert_eq!(first.code, "AAAAAA");
        assert_eq!(second.code, "BBBBBB");
        assert_eq!(codes.calls(), 3);

        // The first file's blob was not touched by the second upload.
        let first_dl = service.download("AAAAAA").await.unwrap();
        assert_eq!(read_all(first_dl.reader).await, b"one");
    }

    #[tokio::test]
    async fn duplicate_on_insert_is_retried_with_new_code() {
        let blobs = Arc::new(MemoryBlobStore::new("/share"));
        let metadata = FlakyMetadata::new(memory_store().await);
        let codes = Arc::new(ScriptedCodes::new(&["RACE01", "RACE01"], "CALM02"));
        let service = FileService::new(blobs, metadata.clone(), codes.clone(), settings());

        service.upload_stream(body(b"first"), "a.txt", "text/plain").await.unwrap();

        // A lookup that cannot see the committed code, as with two uploads in flight.
        metadata.hide_lookups.store(true, Ordering::SeqCst);
        let receipt = service
            .upload_stream(body(b"second"), "b.pdf", "application/pdf")
            .await
            .unwrap();
        metadata.hide_lookups.store(false, Ordering::SeqCst);

        assert_eq!(receipt.code, "CALM02");
        assert_eq!(codes.calls(), 3);
        let dl = service.download("CALM02").await.unwrap();
        assert_eq!(read_all(dl.reader).await, b"second");
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_upload() {
        let blobs = Arc::new(MemoryBlobStore::new("/share"));
        let metadata = Arc::new(memory_store().await);
        let codes = Arc::new(ScriptedCodes::always("SAME00"));
        let service = FileService::new(blobs.clone(), metadata, codes.clone(), settings());

        service.upload_stream(body(b"one"), "a.txt", "text/plain").await.unwrap();
        let err = service
            .upload_stream(body(b"two"), "b.txt", "text/plain")
            .await
            .unwrap_err();

        assert!(matches!(err, ShareError::CodesExhausted(n) if n == DEFAULT_MAX_CODE_ATTEMPTS));
        assert_eq!(codes.calls(), 1 + DEFAULT_MAX_CODE_ATTEMPTS);
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn failed_blob_write_leaves_no_metadata() {
        let blobs = FlakyBlobs::new("/share");
        blobs.fail_put.store(true, Ordering::SeqCst);
        let metadata = Arc::new(memory_store().await);
        let service = FileService::new(
            blobs.clone(),
            metadata.clone(),
            Arc::new(ScriptedCodes::always("FAIL01")),
            settings(),
        );

        let err = service
            .upload_stream(body(b"data"), "a.txt", "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::Blob(BlobError::Connection(_))));
        assert!(matches!(
            metadata.find_by_code("FAIL01").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn entropy_failure_is_fatal() {
        let service = FileService::new(
            Arc::new(MemoryBlobStore::new("/share")),
            Arc::new(memory_store().await),
            Arc::new(BrokenEntropy),
            settings(),
        );
        let err = service
            .upload_stream(body(b"data"), "a.txt", "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::Code(CodeError::Entropy(_))));
    }

    async fn service_with(metadata: SqliteMetadataStore) -> (FileService, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new("/share"));
        let service = FileService::new(
            blobs.clone(),
            Arc::new(metadata),
            Arc::new(ScriptedCodes::always("unused")),
            settings(),
        );
        (service, blobs)
    }

    #[tokio::test]
    async fn expired_code_is_gone_not_missing() {
        let metadata = memory_store().await;
        let now = Utc::now();
        let rec = record("OLD001", now - Duration::hours(1));
        metadata.insert(&rec).await.unwrap();
        let (service, blobs) = service_with(metadata).await;
        let mut bytes: &[u8] = b"old";
        blobs.put(&mut bytes, "/share/OLD001.bin").await.unwrap();

        let err = service.download_at("OLD001", now).await.err().unwrap();
        assert!(matches!(err, ShareError::Expired(code) if code == "OLD001"));
        // The read path never deletes.
        assert!(blobs.contains("/share/OLD001.bin"));
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let (service, _) = service_with(memory_store().await).await;
        for code in ["NEVER1", "", "../etc"] {
            let err = service.download(code).await.err().unwrap();
            assert!(matches!(err, ShareError::NotFound(_)), "{code}: {err:?}");
        }
    }

    #[tokio::test]
    async fn missing_blob_is_a_retrieval_failure() {
        let metadata = memory_store().await;
        metadata
            .insert(&record("LOST01", Utc::now() + Duration::days(1)))
            .await
            .unwrap();
        let (service, _) = service_with(metadata).await;

        let err = service.download("LOST01").await.err().unwrap();
        assert!(matches!(
            err,
            ShareError::Retrieval { source: BlobError::NotFound(_), .. }
        ));
    }
}
