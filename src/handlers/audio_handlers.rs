//! HTTP handlers for audio uploads, metadata and downloads.
//! Uploads are buffered per part and handed to the upload pipeline;
//! downloads stream object bodies straight from the object store.

use crate::{
    auth::AuthUser,
    errors::AppError,
    models::{
        audio_file::StoredAudioRecord,
        upload::{PartInfo, UploadResult},
    },
    services::{object_store::ObjectStoreError, upload_pipeline::UploadOwner},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State, multipart::MultipartRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `POST /media/playlists/{playlist_id}/audiofiles`: upload audio files.
///
/// Each file part becomes one audio file. Responds with one
/// `{filename, error?}` entry per file part: 201 when at least one file was
/// saved, 500 when every file failed.
pub async fn upload_audio_files(
    State(state): State<AppState>,
    user: AuthUser,
    Path(playlist_id): Path<String>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, AppError> {
    let playlist_id = parse_id(&playlist_id, "playlist id")?;
    let mut multipart = multipart.map_err(|err| {
        debug!("rejecting upload: {}", err);
        AppError::bad_request("request is not multipart form data")
    })?;

    let mut batch = state.pipeline.begin(UploadOwner {
        user_id: user.user_id,
        playlist_id,
    });

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) if batch.dispatched() == 0 => {
                warn!("malformed multipart body: {}", err);
                return Err(AppError::bad_request("malformed multipart body"));
            }
            Err(err) => {
                // Parts already dispatched still report below.
                warn!(
                    dispatched = batch.dispatched(),
                    "multipart body ended early: {}", err
                );
                break;
            }
        };

        let Some(filename) = field.file_name().map(str::to_owned) else {
            debug!(field = ?field.name(), "skipping non-file form field");
            continue;
        };
        let content_type = field.content_type().map(str::to_owned);
        debug!(%filename, "processing new part");

        batch
            .dispatch(
                PartInfo {
                    filename,
                    content_type,
                },
                field,
            )
            .await;
    }

    if batch.dispatched() == 0 {
        return Err(AppError::bad_request("no files in request"));
    }

    let results = batch.finish().await;
    let status = upload_status(&results);
    info!(
        user_id = user.user_id,
        playlist_id,
        files = results.len(),
        failed = results.iter().filter(|r| !r.is_ok()).count(),
        "upload request finished"
    );
    Ok((status, Json(results)).into_response())
}

/// 201 if any file was saved, 500 if none was.
pub fn upload_status(results: &[UploadResult]) -> StatusCode {
    if results.iter().any(UploadResult::is_ok) {
        StatusCode::CREATED
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// `GET /media/playlists/{playlist_id}/audiofiles`: records of a playlist.
pub async fn list_playlist_audio_files(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(playlist_id): Path<String>,
) -> Result<Json<Vec<StoredAudioRecord>>, AppError> {
    let playlist_id = parse_id(&playlist_id, "playlist id")?;
    let records = state.records.list_by_playlist(playlist_id).await?;
    Ok(Json(records))
}

/// `GET /media/audiofiles/{id}`: a single record.
pub async fn get_audio_file(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<StoredAudioRecord>, AppError> {
    let id = parse_id(&id, "audio file id")?;
    Ok(Json(state.records.get(id).await?))
}

/// `DELETE /media/audiofiles/{id}`: remove the row, then its object.
///
/// The row goes first so no row ever points at missing bytes; an object
/// that cannot be removed is left for the orphan sweep.
pub async fn delete_audio_file(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_id(&id, "audio file id")?;
    let existing = state.records.get(id).await?;
    if existing.record.uploaded_by != user.user_id {
        return Err(AppError::forbidden("not the owner of this audio file"));
    }

    let deleted = state.records.delete(id).await?;
    let storage_id = deleted.record.storage_id;
    match state.objects.delete(storage_id).await {
        Ok(()) => {}
        Err(ObjectStoreError::NotFound(_)) => {
            debug!(%storage_id, "object already gone");
        }
        Err(err) => {
            warn!(%storage_id, "could not delete object, left for sweep: {}", err);
        }
    }
    info!(id, %storage_id, "audio file deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /media/stream/{storage_id}`: raw object bytes as a stream.
pub async fn stream_audio_file(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(storage_id): Path<String>,
) -> Result<Response, AppError> {
    let storage_id =
        Uuid::parse_str(&storage_id).map_err(|_| AppError::not_found("audio file not found"))?;
    let object = state.objects.open_read(storage_id).await?;
    let body = Body::from_stream(ReaderStream::new(object.reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size_bytes));
    Ok(response)
}

fn parse_id(raw: &str, what: &str) -> Result<i64, AppError> {
    raw.parse::<i64>()
        .map_err(|_| AppError::bad_request(format!("could not parse {what}")))
}
