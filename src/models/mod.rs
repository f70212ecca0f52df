//! Core data models for the audio upload service.
//!
//! `AudioRecord` maps onto one row of the `audio_files` table and serializes
//! as JSON via `serde`. `UploadResult` is the per-part report returned to the
//! uploading client.

pub mod audio_file;
pub mod upload;
