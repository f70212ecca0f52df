//! Defines routes for the audio upload service.
//!
//! ## Structure
//! - **Probes** (no auth)
//!   - `GET    /healthz`
//!   - `GET    /readyz`
//!
//! - **Media** (bearer token required)
//!   - `POST   /media/playlists/{playlist_id}/audiofiles`: multipart upload
//!   - `GET    /media/playlists/{playlist_id}/audiofiles`: list records
//!   - `GET    /media/audiofiles/{id}`: one record
//!   - `DELETE /media/audiofiles/{id}`: delete record and bytes
//!   - `GET    /media/stream/{storage_id}`: download raw bytes

use crate::{
    handlers::{
        audio_handlers::{
            delete_audio_file, get_audio_file, list_playlist_audio_files, stream_audio_file,
            upload_audio_files,
        },
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::get,
};

/// Build the router for all routes.
///
/// `body_limit` caps request bodies in bytes; uploads carry whole files so
/// it is far above axum's default.
pub fn routes(body_limit: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/media/playlists/{playlist_id}/audiofiles",
            get(list_playlist_audio_files).post(upload_audio_files),
        )
        .route(
            "/media/audiofiles/{id}",
            get(get_audio_file).delete(delete_audio_file),
        )
        .route("/media/stream/{storage_id}", get(stream_audio_file))
        .layer(DefaultBodyLimit::max(body_limit))
}
