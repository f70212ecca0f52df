//! Audio upload service: multipart uploads are stored in an object bucket
//! while their embedded tags are parsed, and the resulting metadata lands in
//! SQLite. See [`services::upload_pipeline`] for the per-part flow.

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

pub use state::AppState;

/// Router with state attached, ready to serve.
pub fn build_router(state: AppState, body_limit: usize) -> axum::Router {
    routes::routes::routes(body_limit).with_state(state)
}
