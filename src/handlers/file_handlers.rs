//! HTTP handlers for upload, download and cleanup.
//! Upload bodies are streamed into the service and download bodies are
//! streamed out of the blob store; neither is held fully in memory here.

use crate::{
    errors::AppError, models::file_record::FileRecord, services::file_service::Download,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use std::io;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

const FILE_FIELD: &str = "file";
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: String,
    pub short_code: String,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub message: String,
    pub deleted: usize,
}

/// `POST /upload`: multipart body with a `file` part.
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                debug!("malformed multipart body: {}", err);
                return Err(AppError::bad_request("No file provided"));
            }
        };
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let Some(file_name) = field.file_name().map(str::to_string) else {
            return Err(AppError::bad_request("No file provided"));
        };
        let mime_type = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());

        let stream = field.map(|chunk| chunk.map_err(io::Error::other));
        let receipt = state
            .files
            .upload_stream(stream, &file_name, &mime_type)
            .await?;
        debug!(code = %receipt.code, size = receipt.record.size, "upload accepted");

        return Ok((
            StatusCode::OK,
            Json(UploadResponse {
                message: "File uploaded successfully".into(),
                short_code: receipt.code,
                download_url: receipt.download_url,
                expires_at: receipt.expires_at,
            }),
        ));
    }

    Err(AppError::bad_request("No file provided"))
}

/// `GET /download/{code}`: stream the file as an attachment.
pub async fn download_file(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Response, AppError> {
    debug!(%code, "download requested");
    let Download { record, reader } = state.files.download(&code).await?;

    let body = Body::from_stream(ReaderStream::new(reader));
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &record);

    Ok(response)
}

/// `DELETE /cleanup`: run one reconciliation pass now.
pub async fn cleanup_files(State(state): State<AppState>) -> impl IntoResponse {
    let deleted = state.reconciler.run().await;
    info!(deleted, "manual cleanup completed");
    Json(CleanupResponse {
        message: "Cleanup completed".into(),
        deleted,
    })
}

fn set_download_headers(headers: &mut HeaderMap, record: &FileRecord) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&record.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MIME_TYPE)),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(record.size.max(0) as u64),
    );

    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&record.original_name))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
}

/// `attachment` disposition with an ASCII fallback name and the exact UTF-8
/// name in `filename*`.
fn content_disposition(original_name: &str) -> String {
    let fallback: String = original_name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded = utf8_percent_encode(original_name, NON_ALPHANUMERIC);
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_keeps_ascii_names() {
        assert_eq!(
            content_disposition("report.pdf"),
            "attachment; filename=\"report.pdf\"; filename*=UTF-8''report%2Epdf"
        );
    }

    #[test]
    fn disposition_escapes_quotes_and_unicode() {
        let value = content_disposition("na\"ïve.txt");
        assert!(value.starts_with("attachment; filename=\"na__ve.txt\""));
        assert!(value.ends_with("filename*=UTF-8''na%22%C3%AFve%2Etxt"));
        assert!(HeaderValue::from_str(&value).is_ok());
    }
}
