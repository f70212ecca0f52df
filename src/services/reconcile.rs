//! Reconciliation sweep for objects left behind when a compensating delete
//! failed or the process died between storing bytes and writing the row.
//! Partial uploads of a crashed process are reclaimed on the same pass.

use crate::services::{
    object_store::{ObjectStore, ObjectStoreError},
    record_store::{RecordStore, RecordStoreError},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Objects younger than this are assumed to belong to in-flight uploads.
pub const DEFAULT_SWEEP_GRACE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("listing objects failed: {0}")]
    List(#[from] ObjectStoreError),
    #[error("checking records failed: {0}")]
    Records(#[from] RecordStoreError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
    pub stale_uploads: usize,
}

/// Delete every object older than `grace` that has no metadata row, and
/// every partial upload older than `grace`.
pub async fn sweep_orphans(
    objects: &dyn ObjectStore,
    records: &dyn RecordStore,
    grace: Duration,
) -> Result<SweepReport, SweepError> {
    let cutoff = chrono::Duration::from_std(grace)
        .ok()
        .and_then(|grace| Utc::now().checked_sub_signed(grace))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let mut report = SweepReport::default();

    for object in objects.list().await? {
        report.scanned += 1;
        if object.last_modified > cutoff {
            continue;
        }
        if records.storage_id_exists(object.storage_id).await? {
            continue;
        }
        match objects.delete(object.storage_id).await {
            Ok(()) => {
                info!(storage_id = %object.storage_id, "deleted orphaned object");
                report.deleted += 1;
            }
            Err(err) => {
                warn!(storage_id = %object.storage_id, "could not delete orphaned object: {}", err);
                report.failed += 1;
            }
        }
    }

    report.stale_uploads = objects.purge_stale_uploads(cutoff).await?;
    if report.stale_uploads > 0 {
        info!(count = report.stale_uploads, "removed stale partial uploads");
    }

    Ok(report)
}
