//! src/services/upload_pipeline.rs
//!
//! Concurrent processing of multipart audio uploads.
//!
//! An [`UploadBatch`] is opened per request. The caller feeds it parts in
//! the order the multipart reader yields them; each part is fully buffered on
//! the caller's task (multipart framing is sequential) and then handed to a
//! spawned part task, so the caller can move on to the next part right away.
//!
//! A part task uploads the bytes and parses tags concurrently, joins both,
//! then either persists the record or reports the failure:
//!
//! - storage write failed: no row is written.
//! - row insert failed: the stored object is deleted (best-effort).
//! - tag parsing failed: the part still succeeds with a minimal record.
//!
//! Every dispatched part reports exactly one [`UploadResult`]. Panics inside
//! a part task are caught and reported as that part's failure, and the final
//! wait is bounded by a timeout that cancels outstanding work.

use crate::{
    models::{
        audio_file::AudioRecord,
        upload::{PartInfo, UploadResult},
    },
    services::{
        buffer_pool::{BufferPool, PooledBuffer},
        metadata::MetadataExtractor,
        object_store::ObjectStore,
        record_store::RecordStore,
    },
};
use bytes::Bytes;
use futures::{FutureExt, Stream, StreamExt, pin_mut};
use std::{fmt::Display, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_RESULT_CHANNEL_CAPACITY: usize = 16;
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

pub const CAUSE_READ: &str = "read failure";
pub const CAUSE_STORAGE: &str = "could not store file";
pub const CAUSE_PERSIST: &str = "could not save file metadata";
pub const CAUSE_CANCELLED: &str = "upload cancelled";
pub const CAUSE_TIMEOUT: &str = "timed out";
pub const CAUSE_INTERNAL: &str = "internal error";

/// Tuning knobs for [`UploadPipeline`].
#[derive(Clone, Copy, Debug)]
pub struct PipelineSettings {
    /// Slots in the per-request result channel. Producers block briefly
    /// when it is full; they never hold a pooled buffer while blocked.
    pub result_channel_capacity: usize,

    /// Upper bound on the wait for all part results of one request.
    pub upload_timeout: Duration,

    /// Chunk size passed to the object store; zero selects its default.
    pub upload_chunk_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            result_channel_capacity: DEFAULT_RESULT_CHANNEL_CAPACITY,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            upload_chunk_size: 0,
        }
    }
}

/// Who is uploading and where the files go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadOwner {
    pub user_id: i64,
    pub playlist_id: i64,
}

/// Shared handles used by every upload. Cheap to clone.
#[derive(Clone)]
pub struct UploadPipeline {
    objects: Arc<dyn ObjectStore>,
    records: Arc<dyn RecordStore>,
    extractor: Arc<dyn MetadataExtractor>,
    buffers: BufferPool,
    settings: PipelineSettings,
}

impl UploadPipeline {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn RecordStore>,
        extractor: Arc<dyn MetadataExtractor>,
        buffers: BufferPool,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            objects,
            records,
            extractor,
            buffers,
            settings,
        }
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Open a batch for one upload request.
    pub fn begin(&self, owner: UploadOwner) -> UploadBatch {
        let (results_tx, results_rx) = mpsc::channel(self.settings.result_channel_capacity.max(1));
        UploadBatch {
            pipeline: self.clone(),
            owner,
            results_tx,
            results_rx,
            filenames: Vec::new(),
            settled: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Parts of a single upload request that are being processed.
pub struct UploadBatch {
    pipeline: UploadPipeline,
    owner: UploadOwner,
    results_tx: mpsc::Sender<(usize, UploadResult)>,
    results_rx: mpsc::Receiver<(usize, UploadResult)>,
    /// Filenames in dispatch order; the index is the part's slot.
    filenames: Vec<String>,
    /// Results produced on the dispatching task itself.
    settled: Vec<(usize, UploadResult)>,
    cancel: CancellationToken,
}

impl UploadBatch {
    /// Number of parts dispatched so far.
    pub fn dispatched(&self) -> usize {
        self.filenames.len()
    }

    /// Buffer `body` completely, then process it in the background.
    ///
    /// Returns once the body has been consumed. A body that fails mid-read
    /// settles the part as failed without touching storage.
    pub async fn dispatch<S, E>(&mut self, part: PartInfo, body: S)
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let index = self.filenames.len();
        self.filenames.push(part.filename.clone());

        let mut buffer = self.pipeline.buffers.acquire();
        if let Err(err) = read_part(&mut buffer, body).await {
            warn!(filename = %part.filename, "failed to read part: {}", err);
            self.settled
                .push((index, UploadResult::failed(part.filename, CAUSE_READ)));
            return;
        }
        debug!(filename = %part.filename, size_bytes = buffer.len(), "part buffered");

        let pipeline = self.pipeline.clone();
        let owner = self.owner;
        let cancel = self.cancel.child_token();
        let results_tx = self.results_tx.clone();
        tokio::spawn(async move {
            let filename = part.filename.clone();
            let result = AssertUnwindSafe(process_part(pipeline, owner, part, buffer, cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(filename = %filename, "part task panicked");
                    UploadResult::failed(filename, CAUSE_INTERNAL)
                });
            // The receiver is gone only after the batch timed out.
            let _ = results_tx.send((index, result)).await;
        });
    }

    /// Wait for every dispatched part and return one result per part, in
    /// dispatch order. Parts still running when the timeout expires are
    /// cancelled and reported as timed out.
    pub async fn finish(self) -> Vec<UploadResult> {
        let UploadBatch {
            pipeline,
            results_tx,
            mut results_rx,
            filenames,
            settled,
            cancel,
            ..
        } = self;
        drop(results_tx);

        let mut slots: Vec<Option<UploadResult>> = vec![None; filenames.len()];
        let pending = filenames.len() - settled.len();
        for (index, result) in settled {
            slots[index] = Some(result);
        }

        let collected = tokio::time::timeout(pipeline.settings.upload_timeout, async {
            let mut received = 0;
            while received < pending {
                match results_rx.recv().await {
                    Some((index, result)) => {
                        slots[index] = Some(result);
                        received += 1;
                    }
                    None => break,
                }
            }
            received
        })
        .await;

        match collected {
            Ok(received) if received == pending => {}
            Ok(received) => {
                error!(received, pending, "part tasks exited without reporting");
            }
            Err(_) => {
                warn!(
                    timeout_secs = pipeline.settings.upload_timeout.as_secs(),
                    "upload timed out, cancelling outstanding parts"
                );
                cancel.cancel();
            }
        }

        slots
            .into_iter()
            .zip(filenames)
            .map(|(slot, filename)| {
                slot.unwrap_or_else(|| UploadResult::failed(filename, CAUSE_TIMEOUT))
            })
            .collect()
    }
}

async fn read_part<S, E>(buffer: &mut PooledBuffer, body: S) -> Result<(), E>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    pin_mut!(body);
    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(())
}

/// Upload and tag-parse one buffered part, then persist or roll back.
async fn process_part(
    pipeline: UploadPipeline,
    owner: UploadOwner,
    part: PartInfo,
    buffer: PooledBuffer,
    cancel: CancellationToken,
) -> UploadResult {
    let storage_id = Uuid::new_v4();
    let data = Arc::new(buffer);

    let upload = pipeline.objects.upload(
        storage_id,
        data.as_slice(),
        pipeline.settings.upload_chunk_size,
        &cancel,
    );
    let extract = {
        let data = Arc::clone(&data);
        let extractor = Arc::clone(&pipeline.extractor);
        tokio::task::spawn_blocking(move || extractor.extract(data.as_slice()))
    };
    let (uploaded, extracted) = tokio::join!(upload, extract);

    if let Err(err) = uploaded {
        warn!(%storage_id, filename = %part.filename, "storage upload failed: {}", err);
        return UploadResult::failed(part.filename, CAUSE_STORAGE);
    }
    debug!(%storage_id, filename = %part.filename, "upload finished");

    let mut record = AudioRecord::minimal(
        storage_id,
        part.filename.clone(),
        owner.user_id,
        owner.playlist_id,
    );
    match extracted {
        Ok(Ok(metadata)) => {
            metadata.apply_to(&mut record, part.content_type.as_deref(), data.as_slice());
            debug!(%storage_id, filename = %part.filename, "tags parsed");
        }
        Ok(Err(err)) => {
            warn!(%storage_id, filename = %part.filename, "tag parsing failed, saving minimal record: {}", err);
        }
        Err(err) => {
            warn!(%storage_id, filename = %part.filename, "tag parsing task failed, saving minimal record: {}", err);
        }
    }
    drop(data);

    if cancel.is_cancelled() {
        compensate(pipeline.objects.as_ref(), storage_id).await;
        return UploadResult::failed(part.filename, CAUSE_CANCELLED);
    }

    match pipeline.records.insert(&record).await {
        Ok(id) => {
            info!(id, %storage_id, filename = %part.filename, "audio file saved");
            UploadResult::ok(part.filename)
        }
        Err(err) => {
            error!(%storage_id, filename = %part.filename, "failed to save metadata: {}", err);
            compensate(pipeline.objects.as_ref(), storage_id).await;
            UploadResult::failed(part.filename, CAUSE_PERSIST)
        }
    }
}

/// Delete an object whose record could not be written. A failure leaves an
/// orphan for the reconciliation sweep and is only logged.
async fn compensate(objects: &dyn ObjectStore, storage_id: Uuid) {
    match objects.delete(storage_id).await {
        Ok(()) => debug!(%storage_id, "rolled back stored object"),
        Err(err) => error!(%storage_id, "compensating delete failed, object orphaned: {}", err),
    }
}
