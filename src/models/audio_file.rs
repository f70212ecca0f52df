//! Represents an uploaded audio file and the metadata extracted from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata record for one uploaded audio file.
///
/// Optional fields are either absent or hold a meaningful value: empty strings
/// and zero numbers coming out of tag parsing are normalized to `None` before
/// a record is built, never stored as-is.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioRecord {
    /// Key of the object holding the raw bytes. Join key with the bucket.
    pub storage_id: Uuid,

    /// Filename as declared by the uploading client.
    pub filename: String,

    /// When the upload was accepted.
    pub uploaded_at: DateTime<Utc>,

    /// User that uploaded the file.
    pub uploaded_by: i64,

    /// Destination playlist.
    pub playlist_id: i64,

    pub title: Option<String>,
    pub album: Option<String>,

    /// Performer, album artist and composer, in that order.
    pub artists: Option<Vec<String>>,

    /// Duration in seconds.
    pub duration: Option<f64>,

    pub track_number: Option<u32>,
    pub track_total: Option<u32>,
    pub genre: Option<String>,
    pub icon: Option<AudioIcon>,
    pub format: Option<AudioFormat>,
}

impl AudioRecord {
    /// Record carrying only the structural fields: ids, owner and filename.
    pub fn minimal(
        storage_id: Uuid,
        filename: impl Into<String>,
        uploaded_by: i64,
        playlist_id: i64,
    ) -> Self {
        Self {
            storage_id,
            filename: filename.into(),
            uploaded_at: Utc::now(),
            uploaded_by,
            playlist_id,
            title: None,
            album: None,
            artists: None,
            duration: None,
            track_number: None,
            track_total: None,
            genre: None,
            icon: None,
            format: None,
        }
    }

    /// True when nothing beyond the structural fields is set.
    pub fn is_minimal(&self) -> bool {
        self.title.is_none()
            && self.album.is_none()
            && self.artists.is_none()
            && self.duration.is_none()
            && self.track_number.is_none()
            && self.track_total.is_none()
            && self.genre.is_none()
            && self.icon.is_none()
            && self.format.is_none()
    }
}

/// Embedded cover art.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioIcon {
    pub mime_type: String,

    /// Raw image bytes, base64 encoded on the wire.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Audio stream parameters.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub mime_type: Option<String>,

    /// Bits per second.
    pub bitrate: Option<u32>,
    pub channels: Option<u8>,
    pub codec: Option<String>,
    pub container: Option<String>,

    /// Samples per second.
    pub sample_rate: Option<u32>,
}

impl AudioFormat {
    pub fn is_empty(&self) -> bool {
        self.mime_type.is_none()
            && self.bitrate.is_none()
            && self.channels.is_none()
            && self.codec.is_none()
            && self.container.is_none()
            && self.sample_rate.is_none()
    }
}

/// A persisted record together with its database id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoredAudioRecord {
    pub id: i64,

    #[serde(flatten)]
    pub record: AudioRecord,
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(D::Error::custom)
    }
}
