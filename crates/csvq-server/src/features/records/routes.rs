//! Record API routes
//!
//! - `POST /api/v1/upload` - stream a multipart CSV upload onto the record queue
//! - `GET /api/v1/data` - list stored rows with equality filters and paging

use axum::{
    extract::{
        multipart::MultipartError, rejection::QueryRejection, DefaultBodyLimit, Multipart, Query,
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::io;
use tokio_util::io::StreamReader;

use super::queries::{list, ListRowsError, ListRowsQuery, Paging};
use super::RecordsState;
use crate::error::{AppError, AppResult};
use crate::ingest::IngestError;

/// Multipart field carrying the CSV file
pub const FILE_FIELD: &str = "file";

pub fn records_routes(max_upload_bytes: usize) -> Router<RecordsState> {
    Router::new()
        .route(
            "/upload",
            post(upload_file).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/data", get(list_rows))
}

/// Publish every record of the uploaded `file` field. Answers in plain text.
#[tracing::instrument(skip(state, multipart))]
async fn upload_file(
    State(state): State<RecordsState>,
    mut multipart: Multipart,
) -> Result<Response, UploadApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        tracing::info!(
            filename = field.file_name().unwrap_or("<unnamed>"),
            queue = state.publisher.queue(),
            "Receiving upload"
        );

        let reader = StreamReader::new(field.map_err(io::Error::other));
        tokio::pin!(reader);

        let summary = state.publisher.publish_upload(reader).await?;

        let message = format!(
            "File uploaded and processed in chunks, {} lines published successfully",
            summary.published
        );
        return Ok((StatusCode::OK, message).into_response());
    }

    Err(UploadApiError::MissingFile)
}

/// Rows as a JSON array, or `{}` when nothing matches.
#[tracing::instrument(skip(state))]
async fn list_rows(
    State(state): State<RecordsState>,
    paging: Result<Query<Paging>, QueryRejection>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let Query(paging) = paging.map_err(|e| AppError::Validation(e.body_text()))?;
    let query = ListRowsQuery::new(paging, &params)?;
    let rows = list::handle(state.store.as_ref(), &query).await?;

    if rows.is_empty() {
        return Ok(Json(json!({})).into_response());
    }

    Ok(Json(rows).into_response())
}

impl From<ListRowsError> for AppError {
    fn from(err: ListRowsError) -> Self {
        match err {
            ListRowsError::Database(e) => AppError::Database(e),
            other => AppError::Validation(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum UploadApiError {
    #[error("No '{}' field in the upload", FILE_FIELD)]
    MissingFile,

    #[error("Invalid multipart request: {0}")]
    Multipart(#[from] MultipartError),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl IntoResponse for UploadApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            UploadApiError::MissingFile => StatusCode::BAD_REQUEST,
            UploadApiError::Multipart(e) => {
                tracing::warn!("Rejected multipart request: {}", e);
                e.status()
            },
            UploadApiError::Ingest(e) if e.is_malformed_input() => {
                tracing::warn!(published = e.published(), "Malformed upload: {}", e);
                StatusCode::BAD_REQUEST
            },
            UploadApiError::Ingest(e) => {
                tracing::error!(published = e.published(), "Upload failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            },
        };

        let message = match &self {
            UploadApiError::Ingest(e) if e.is_malformed_input() => format!(
                "Invalid CSV input: {} ({} lines published before the error)",
                e,
                e.published()
            ),
            UploadApiError::Ingest(e) => format!(
                "Failed to process upload: {} ({} lines published before the error)",
                e,
                e.published()
            ),
            other => other.to_string(),
        };

        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FilterError;

    #[test]
    fn test_missing_file_is_bad_request() {
        let response = UploadApiError::MissingFile.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_list_error_mapping() {
        let err = AppError::from(ListRowsError::Filter(FilterError::InvalidTimestamp {
            column: "created_at",
            value: "x".to_string(),
        }));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
