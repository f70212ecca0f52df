//! src/services/record_store.rs
//!
//! Relational persistence of audio metadata. One row per uploaded file in the
//! `audio_files` table; the artist list is kept as an ordered JSON array.

use crate::models::audio_file::{AudioFormat, AudioIcon, AudioRecord, StoredAudioRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const INIT_MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

const SELECT_COLUMNS: &str = "SELECT id, storage_id, filename, uploaded_at, uploaded_by, playlist_id,
        title, album, artists, duration, track_number, track_total, genre,
        icon, icon_mime_type, mime_type, bitrate, channels, codec, container, sample_rate
     FROM audio_files";

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("audio file `{0}` not found")]
    NotFound(i64),
    #[error("malformed audio file row: {0}")]
    Malformed(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RecordStoreResult<T> = Result<T, RecordStoreError>;

/// Metadata rows for uploaded audio files.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert `record` as a single row and return its database id.
    async fn insert(&self, record: &AudioRecord) -> RecordStoreResult<i64>;

    async fn get(&self, id: i64) -> RecordStoreResult<StoredAudioRecord>;

    /// Records of a playlist, oldest first.
    async fn list_by_playlist(&self, playlist_id: i64) -> RecordStoreResult<Vec<StoredAudioRecord>>;

    /// Delete the row and return what it held.
    async fn delete(&self, id: i64) -> RecordStoreResult<StoredAudioRecord>;

    async fn storage_id_exists(&self, storage_id: Uuid) -> RecordStoreResult<bool>;

    async fn health_check(&self) -> RecordStoreResult<()>;
}

/// [`RecordStore`] on a shared SQLite pool.
#[derive(Clone)]
pub struct SqliteRecordStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn migrate(&self) -> RecordStoreResult<()> {
        let statements = INIT_MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            tracing::debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert(&self, record: &AudioRecord) -> RecordStoreResult<i64> {
        let artists = record
            .artists
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let format = record.format.clone().unwrap_or_default();
        let (icon, icon_mime_type) = match &record.icon {
            Some(icon) => (Some(icon.data.as_slice()), Some(icon.mime_type.as_str())),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO audio_files (
                storage_id, filename, uploaded_at, uploaded_by, playlist_id,
                title, album, artists, duration, track_number, track_total, genre,
                icon, icon_mime_type, mime_type, bitrate, channels, codec, container, sample_rate
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.storage_id.to_string())
        .bind(&record.filename)
        .bind(record.uploaded_at)
        .bind(record.uploaded_by)
        .bind(record.playlist_id)
        .bind(record.title.as_deref())
        .bind(record.album.as_deref())
        .bind(artists)
        .bind(record.duration)
        .bind(record.track_number.map(i64::from))
        .bind(record.track_total.map(i64::from))
        .bind(record.genre.as_deref())
        .bind(icon)
        .bind(icon_mime_type)
        .bind(format.mime_type)
        .bind(format.bitrate.map(i64::from))
        .bind(format.channels.map(i64::from))
        .bind(format.codec)
        .bind(format.container)
        .bind(format.sample_rate.map(i64::from))
        .execute(&*self.db)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn get(&self, id: i64) -> RecordStoreResult<StoredAudioRecord> {
        let row = sqlx::query_as::<_, AudioFileRow>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(RecordStoreError::NotFound(id))?;
        row.try_into()
    }

    async fn list_by_playlist(&self, playlist_id: i64) -> RecordStoreResult<Vec<StoredAudioRecord>> {
        let rows = sqlx::query_as::<_, AudioFileRow>(&format!(
            "{SELECT_COLUMNS} WHERE playlist_id = ? ORDER BY id ASC"
        ))
        .bind(playlist_id)
        .fetch_all(&*self.db)
        .await?;
        rows.into_iter().map(StoredAudioRecord::try_from).collect()
    }

    async fn delete(&self, id: i64) -> RecordStoreResult<StoredAudioRecord> {
        let existing = self.get(id).await?;
        let result = sqlx::query("DELETE FROM audio_files WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RecordStoreError::NotFound(id));
        }
        Ok(existing)
    }

    async fn storage_id_exists(&self, storage_id: Uuid) -> RecordStoreResult<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS(SELECT 1 FROM audio_files WHERE storage_id = ?)",
        )
        .bind(storage_id.to_string())
        .fetch_one(&*self.db)
        .await?;
        Ok(found != 0)
    }

    async fn health_check(&self) -> RecordStoreResult<()> {
        match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?
        {
            1 => Ok(()),
            v => Err(RecordStoreError::Malformed(format!(
                "unexpected health check result: {v}"
            ))),
        }
    }
}

#[derive(FromRow, Debug)]
struct AudioFileRow {
    id: i64,
    storage_id: String,
    filename: String,
    uploaded_at: DateTime<Utc>,
    uploaded_by: i64,
    playlist_id: i64,
    title: Option<String>,
    album: Option<String>,
    artists: Option<String>,
    duration: Option<f64>,
    track_number: Option<i64>,
    track_total: Option<i64>,
    genre: Option<String>,
    icon: Option<Vec<u8>>,
    icon_mime_type: Option<String>,
    mime_type: Option<String>,
    bitrate: Option<i64>,
    channels: Option<i64>,
    codec: Option<String>,
    container: Option<String>,
    sample_rate: Option<i64>,
}

fn narrow<T: TryFrom<i64>>(column: &str, value: Option<i64>) -> RecordStoreResult<Option<T>> {
    value
        .map(|v| {
            T::try_from(v)
                .map_err(|_| RecordStoreError::Malformed(format!("{column} out of range: {v}")))
        })
        .transpose()
}

impl TryFrom<AudioFileRow> for StoredAudioRecord {
    type Error = RecordStoreError;

    fn try_from(row: AudioFileRow) -> RecordStoreResult<Self> {
        let storage_id = Uuid::parse_str(&row.storage_id)
            .map_err(|e| RecordStoreError::Malformed(format!("storage_id: {e}")))?;
        let artists = row
            .artists
            .as_deref()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()?;
        let icon = match (row.icon, row.icon_mime_type) {
            (Some(data), Some(mime_type)) => Some(AudioIcon { mime_type, data }),
            (None, None) => None,
            _ => {
                return Err(RecordStoreError::Malformed(
                    "icon and icon_mime_type must be set together".into(),
                ));
            }
        };
        let format = AudioFormat {
            mime_type: row.mime_type,
            bitrate: narrow("bitrate", row.bitrate)?,
            channels: narrow("channels", row.channels)?,
            codec: row.codec,
            container: row.container,
            sample_rate: narrow("sample_rate", row.sample_rate)?,
        };

        Ok(StoredAudioRecord {
            id: row.id,
            record: AudioRecord {
                storage_id,
                filename: row.filename,
                uploaded_at: row.uploaded_at,
                uploaded_by: row.uploaded_by,
                playlist_id: row.playlist_id,
                title: row.title,
                album: row.album,
                artists,
                duration: row.duration,
                track_number: narrow("track_number", row.track_number)?,
                track_total: narrow("track_total", row.track_total)?,
                genre: row.genre,
                icon,
                format: (!format.is_empty()).then_some(format),
            },
        })
    }
}
