//! Embedded tag extraction.
//!
//! Tags are read with `lofty` from the fully buffered file. Raw values are
//! collected into [`RawTags`] and normalized into [`TrackMetadata`], which is
//! what ends up on an [`AudioRecord`]. Extraction failures never fail an
//! upload: callers fall back to [`AudioRecord::minimal`].

use crate::models::audio_file::{AudioFormat, AudioIcon, AudioRecord};
use lofty::file::FileType;
use lofty::picture::MimeType;
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::ItemKey;
use std::{io::Cursor, time::Duration};
use thiserror::Error;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("could not probe audio format: {0}")]
    Probe(#[from] std::io::Error),
    #[error("could not parse tags: {0}")]
    Parse(#[from] lofty::error::LoftyError),
}

/// Reads descriptive metadata out of an in-memory audio file.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, data: &[u8]) -> Result<TrackMetadata, MetadataError>;
}

/// [`MetadataExtractor`] backed by `lofty`. Supports ID3, Vorbis comments,
/// APE, MP4 ilst and RIFF INFO tag blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyExtractor;

impl MetadataExtractor for LoftyExtractor {
    fn extract(&self, data: &[u8]) -> Result<TrackMetadata, MetadataError> {
        let tagged_file = Probe::new(Cursor::new(data)).guess_file_type()?.read()?;

        let properties = tagged_file.properties();
        let mut raw = RawTags {
            duration: properties.duration(),
            // lofty reports kbps
            bitrate_kbps: properties
                .audio_bitrate()
                .or_else(|| properties.overall_bitrate()),
            channels: properties.channels(),
            sample_rate: properties.sample_rate(),
            file_type: Some(tagged_file.file_type()),
            ..RawTags::default()
        };

        if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
            raw.title = tag.title().map(|s| s.into_owned());
            raw.album = tag.album().map(|s| s.into_owned());
            raw.artist = tag.artist().map(|s| s.into_owned());
            raw.album_artist = tag.get_string(&ItemKey::AlbumArtist).map(str::to_owned);
            raw.composer = tag.get_string(&ItemKey::Composer).map(str::to_owned);
            raw.genre = tag.genre().map(|s| s.into_owned());
            raw.track = tag.track();
            raw.track_total = tag.track_total();
            if let Some(picture) = tag.pictures().first() {
                let declared: Option<&MimeType> = picture.mime_type().into();
                raw.picture = Some(RawPicture {
                    mime_type: declared.map(|m| m.as_str().to_owned()),
                    data: picture.data().to_vec(),
                });
            }
        }

        Ok(TrackMetadata::from_raw(raw))
    }
}

/// Values as they come out of a tag block, before normalization.
#[derive(Debug, Default, Clone)]
pub struct RawTags {
    pub title: Option<String>,
    pub album: Option<String>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub composer: Option<String>,
    pub genre: Option<String>,
    pub track: Option<u32>,
    pub track_total: Option<u32>,
    pub picture: Option<RawPicture>,
    pub duration: Duration,
    pub bitrate_kbps: Option<u32>,
    pub channels: Option<u8>,
    pub sample_rate: Option<u32>,
    pub file_type: Option<FileType>,
}

#[derive(Debug, Clone)]
pub struct RawPicture {
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

/// Normalized metadata: every `Some` holds a non-empty, non-zero value.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub album: Option<String>,
    pub artists: Option<Vec<String>>,
    pub duration: Option<f64>,
    pub track_number: Option<u32>,
    pub track_total: Option<u32>,
    pub genre: Option<String>,
    pub icon: Option<AudioIcon>,
    pub format: AudioFormat,
}

impl TrackMetadata {
    pub fn from_raw(raw: RawTags) -> Self {
        let artists: Vec<String> = [raw.artist, raw.album_artist, raw.composer]
            .into_iter()
            .flatten()
            .filter_map(non_empty)
            .collect();

        let icon = raw
            .picture
            .filter(|picture| !picture.data.is_empty())
            .map(|picture| {
                let mime_type = picture
                    .mime_type
                    .and_then(non_empty)
                    .or_else(|| sniff_mime(&picture.data))
                    .unwrap_or_else(|| OCTET_STREAM.to_owned());
                AudioIcon {
                    mime_type,
                    data: picture.data,
                }
            });

        let (container, codec) = raw.file_type.map(describe_file_type).unwrap_or_default();

        Self {
            title: raw.title.and_then(non_empty),
            album: raw.album.and_then(non_empty),
            artists: (!artists.is_empty()).then_some(artists),
            duration: (!raw.duration.is_zero()).then(|| raw.duration.as_secs_f64()),
            track_number: raw.track.filter(|n| *n != 0),
            track_total: raw.track_total.filter(|n| *n != 0),
            genre: raw.genre.and_then(non_empty),
            icon,
            format: AudioFormat {
                mime_type: None,
                bitrate: raw
                    .bitrate_kbps
                    .filter(|b| *b != 0)
                    .map(|b| b.saturating_mul(1000)),
                channels: raw.channels.filter(|c| *c != 0),
                codec: codec.map(str::to_owned),
                container: container.map(str::to_owned),
                sample_rate: raw.sample_rate.filter(|r| *r != 0),
            },
        }
    }

    /// Copy the extracted fields onto `record`. The format MIME type is the
    /// part's declared content type, or sniffed from `data` when the client
    /// sent none or a generic one.
    pub fn apply_to(self, record: &mut AudioRecord, declared_content_type: Option<&str>, data: &[u8]) {
        record.title = self.title;
        record.album = self.album;
        record.artists = self.artists;
        record.duration = self.duration;
        record.track_number = self.track_number;
        record.track_total = self.track_total;
        record.genre = self.genre;
        record.icon = self.icon;

        let mut format = self.format;
        format.mime_type = declared_content_type
            .map(str::trim)
            .filter(|ct| !ct.is_empty() && !ct.eq_ignore_ascii_case(OCTET_STREAM))
            .map(str::to_owned)
            .or_else(|| sniff_mime(data));
        record.format = (!format.is_empty()).then_some(format);
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_owned())
    }
}

fn sniff_mime(data: &[u8]) -> Option<String> {
    infer::get(data).map(|kind| kind.mime_type().to_owned())
}

/// Container and codec names for a lofty file type.
fn describe_file_type(file_type: FileType) -> (Option<&'static str>, Option<&'static str>) {
    match file_type {
        FileType::Aac => (Some("ADTS"), Some("aac")),
        FileType::Aiff => (Some("AIFF"), Some("pcm")),
        FileType::Ape => (Some("APE"), Some("ape")),
        FileType::Flac => (Some("FLAC"), Some("flac")),
        FileType::Mpeg => (Some("MPEG"), Some("mp3")),
        FileType::Mp4 => (Some("MPEG-4"), None),
        FileType::Mpc => (Some("Musepack"), Some("mpc")),
        FileType::Opus => (Some("Ogg"), Some("opus")),
        FileType::Vorbis => (Some("Ogg"), Some("vorbis")),
        FileType::Speex => (Some("Ogg"), Some("speex")),
        FileType::Wav => (Some("WAVE"), Some("pcm")),
        FileType::WavPack => (Some("WavPack"), Some("wavpack")),
        _ => (None, None),
    }
}
