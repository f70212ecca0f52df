//! Shared application state handed to every handler.

use crate::{
    auth::JwtAuth,
    services::{
        buffer_pool::BufferPool,
        metadata::MetadataExtractor,
        object_store::ObjectStore,
        record_store::RecordStore,
        upload_pipeline::{PipelineSettings, UploadPipeline},
    },
};
use std::sync::Arc;

/// Explicitly constructed service handles. Tests swap in doubles for any
/// of the gateways.
#[derive(Clone)]
pub struct AppState {
    pub objects: Arc<dyn ObjectStore>,
    pub records: Arc<dyn RecordStore>,
    pub pipeline: UploadPipeline,
    pub auth: JwtAuth,
}

impl AppState {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn RecordStore>,
        extractor: Arc<dyn MetadataExtractor>,
        auth: JwtAuth,
        settings: PipelineSettings,
    ) -> Self {
        let pipeline = UploadPipeline::new(
            Arc::clone(&objects),
            Arc::clone(&records),
            extractor,
            BufferPool::default(),
            settings,
        );
        Self {
            objects,
            records,
            pipeline,
            auth,
        }
    }
}
