//! Upload pipeline and the gateways it drives.

pub mod buffer_pool;
pub mod metadata;
pub mod object_store;
pub mod reconcile;
pub mod record_store;
pub mod upload_pipeline;
