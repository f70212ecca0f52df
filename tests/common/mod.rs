//! Shared test doubles for the upload pipeline.
//!
//! Faults are injected by content or filename so a single request can mix
//! healthy and failing parts:
//! - bytes starting with `FAIL-STORE` fail the storage write
//! - bytes starting with `PANIC-STORE` panic inside the storage write
//! - bytes starting with `SLOW` wait in storage until cancelled
//! - bytes starting with `LATE` finish storing after 400 ms, ignoring
//!   cancellation
//! - bytes starting with `TAGS` parse as a fully tagged file; anything else
//!   fails tag extraction
//! - filenames containing `db-fail` fail the row insert

#![allow(dead_code)]

use async_trait::async_trait;
use audio_store::{
    AppState,
    auth::{Claims, JwtAuth},
    models::audio_file::{AudioFormat, AudioIcon, AudioRecord, StoredAudioRecord},
    models::upload::PartInfo,
    services::{
        buffer_pool::BufferPool,
        metadata::{MetadataError, MetadataExtractor, TrackMetadata},
        object_store::{
            ObjectReader, ObjectStore, ObjectStoreError, ObjectStoreResult, ObjectSummary,
        },
        record_store::{RecordStore, RecordStoreError, RecordStoreResult, SqliteRecordStore},
        upload_pipeline::{PipelineSettings, UploadPipeline},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, stream};
use jsonwebtoken::{EncodingKey, Header, encode};
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    collections::HashMap,
    convert::Infallible,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const JWT_SECRET: &[u8] = b"test-secret";
pub const TAGGED: &[u8] = b"TAGS";
pub const FAIL_STORE: &[u8] = b"FAIL-STORE";
pub const PANIC_STORE: &[u8] = b"PANIC-STORE";
pub const SLOW: &[u8] = b"SLOW";
pub const LATE: &[u8] = b"LATE";

/// In-memory bucket with injectable faults and a log of delete calls.
#[derive(Default)]
pub struct MemoryObjectStore {
    pub objects: Mutex<HashMap<Uuid, Vec<u8>>>,
    pub deletes: Mutex<Vec<Uuid>>,
    pub fail_deletes: AtomicBool,
}

impl MemoryObjectStore {
    pub fn ids(&self) -> Vec<Uuid> {
        self.objects.lock().unwrap().keys().copied().collect()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.objects.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn delete_calls(&self) -> Vec<Uuid> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(
        &self,
        storage_id: Uuid,
        data: &[u8],
        _size_hint: usize,
        cancel: &CancellationToken,
    ) -> ObjectStoreResult<()> {
        if data.starts_with(FAIL_STORE) {
            return Err(ObjectStoreError::Io(io::Error::other("injected write failure")));
        }
        if data.starts_with(PANIC_STORE) {
            panic!("injected panic in storage write");
        }
        if data.starts_with(SLOW) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ObjectStoreError::Cancelled(storage_id)),
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
        }
        if data.starts_with(LATE) {
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
        self.objects
            .lock()
            .unwrap()
            .insert(storage_id, data.to_vec());
        Ok(())
    }

    async fn delete(&self, storage_id: Uuid) -> ObjectStoreResult<()> {
        self.deletes.lock().unwrap().push(storage_id);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Io(io::Error::other("injected delete failure")));
        }
        match self.objects.lock().unwrap().remove(&storage_id) {
            Some(_) => Ok(()),
            None => Err(ObjectStoreError::NotFound(storage_id)),
        }
    }

    async fn open_read(&self, storage_id: Uuid) -> ObjectStoreResult<ObjectReader> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(&storage_id)
            .cloned()
            .ok_or(ObjectStoreError::NotFound(storage_id))?;
        Ok(ObjectReader {
            size_bytes: data.len() as u64,
            reader: Box::new(io::Cursor::new(data)),
        })
    }

    async fn list(&self) -> ObjectStoreResult<Vec<ObjectSummary>> {
        Ok(self
            .ids()
            .into_iter()
            .map(|storage_id| ObjectSummary {
                storage_id,
                last_modified: Utc::now(),
            })
            .collect())
    }

    async fn health_check(&self) -> ObjectStoreResult<()> {
        Ok(())
    }
}

/// Real SQLite store that refuses rows whose filename contains `db-fail`.
pub struct FaultyRecordStore {
    pub inner: SqliteRecordStore,
}

#[async_trait]
impl RecordStore for FaultyRecordStore {
    async fn insert(&self, record: &AudioRecord) -> RecordStoreResult<i64> {
        if record.filename.contains("db-fail") {
            return Err(RecordStoreError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        self.inner.insert(record).await
    }

    async fn get(&self, id: i64) -> RecordStoreResult<StoredAudioRecord> {
        self.inner.get(id).await
    }

    async fn list_by_playlist(&self, playlist_id: i64) -> RecordStoreResult<Vec<StoredAudioRecord>> {
        self.inner.list_by_playlist(playlist_id).await
    }

    async fn delete(&self, id: i64) -> RecordStoreResult<StoredAudioRecord> {
        self.inner.delete(id).await
    }

    async fn storage_id_exists(&self, storage_id: Uuid) -> RecordStoreResult<bool> {
        self.inner.storage_id_exists(storage_id).await
    }

    async fn health_check(&self) -> RecordStoreResult<()> {
        self.inner.health_check().await
    }
}

/// Parses bytes starting with `TAGS` as a fully tagged track.
pub struct ScriptedExtractor;

pub fn full_metadata() -> TrackMetadata {
    TrackMetadata {
        title: Some("Song A".into()),
        album: Some("Album A".into()),
        artists: Some(vec!["Performer".into(), "Album Artist".into(), "Composer".into()]),
        duration: Some(215.0),
        track_number: Some(4),
        track_total: Some(11),
        genre: Some("Rock".into()),
        icon: Some(AudioIcon {
            mime_type: "image/jpeg".into(),
            data: vec![0xff, 0xd8, 0xff, 0xe0],
        }),
        format: AudioFormat {
            mime_type: None,
            bitrate: Some(320_000),
            channels: Some(2),
            codec: Some("mp3".into()),
            container: Some("MPEG".into()),
            sample_rate: Some(44_100),
        },
    }
}

impl MetadataExtractor for ScriptedExtractor {
    fn extract(&self, data: &[u8]) -> Result<TrackMetadata, MetadataError> {
        if data.starts_with(TAGGED) {
            Ok(full_metadata())
        } else {
            Err(MetadataError::Probe(io::Error::other("no tag block")))
        }
    }
}

pub struct Harness {
    pub objects: Arc<MemoryObjectStore>,
    pub records: Arc<FaultyRecordStore>,
    pub settings: PipelineSettings,
}

impl Harness {
    pub async fn new(settings: PipelineSettings) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let inner = SqliteRecordStore::new(Arc::new(pool));
        inner.migrate().await.unwrap();
        Self {
            objects: Arc::new(MemoryObjectStore::default()),
            records: Arc::new(FaultyRecordStore { inner }),
            settings,
        }
    }

    pub async fn with_defaults() -> Self {
        Self::new(PipelineSettings::default()).await
    }

    pub fn pipeline(&self) -> UploadPipeline {
        UploadPipeline::new(
            self.objects.clone(),
            self.records.clone(),
            Arc::new(ScriptedExtractor),
            BufferPool::new(1024),
            self.settings,
        )
    }

    pub fn state(&self) -> AppState {
        AppState::new(
            self.objects.clone(),
            self.records.clone(),
            Arc::new(ScriptedExtractor),
            JwtAuth::new(JWT_SECRET),
            self.settings,
        )
    }

    pub async fn rows(&self) -> Vec<StoredAudioRecord> {
        let ids: Vec<i64> = sqlx::query_scalar::<_, i64>("SELECT id FROM audio_files ORDER BY id")
            .fetch_all(&*self.records.inner.db)
            .await
            .unwrap();
        let mut rows = Vec::new();
        for id in ids {
            rows.push(self.records.get(id).await.unwrap());
        }
        rows
    }

    pub async fn row_for(&self, filename: &str) -> Option<StoredAudioRecord> {
        self.rows()
            .await
            .into_iter()
            .find(|r| r.record.filename == filename)
    }
}

pub fn part_info(filename: &str, content_type: Option<&str>) -> PartInfo {
    PartInfo {
        filename: filename.to_string(),
        content_type: content_type.map(str::to_string),
    }
}

/// Body delivered in small chunks, like a multipart field.
pub fn body(data: &[u8]) -> impl Stream<Item = Result<Bytes, Infallible>> + use<> {
    let chunks: Vec<Result<Bytes, Infallible>> = data
        .chunks(3)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks)
}

/// Body that breaks after its first chunk.
pub fn broken_body() -> impl Stream<Item = Result<Bytes, io::Error>> {
    stream::iter(vec![
        Ok(Bytes::from_static(b"TAGS partial")),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")),
    ])
}

pub fn token_for(user_id: i64) -> String {
    let claims = Claims {
        user_id,
        exp: (Utc::now().timestamp() + 3600) as u64,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET)).unwrap()
}
