//! src/services/object_store.rs
//!
//! Object storage for raw audio bytes. Every object is addressed by a random
//! storage id, never by the client filename. [`FsObjectStore`] keeps one
//! bucket on local disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{storage_id}`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Write chunk size used when the caller gives no size hint.
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 5 * 1024 * 1024;

const TMP_PREFIX: &str = ".tmp-";
const PROBE_PREFIX: &str = ".readyz-";

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object `{0}` not found")]
    NotFound(Uuid),
    #[error("upload of object `{0}` was cancelled")]
    Cancelled(Uuid),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Readable object payload.
pub struct ObjectReader {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub size_bytes: u64,
}

/// Listing entry, used by the orphan sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub storage_id: Uuid,
    pub last_modified: DateTime<Utc>,
}

/// Bucket of audio objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `storage_id`. `size_hint` sets the write chunk
    /// size; zero selects [`DEFAULT_UPLOAD_CHUNK_SIZE`]. Returns only once the
    /// object is durable. On error or cancellation no object is visible.
    async fn upload(
        &self,
        storage_id: Uuid,
        data: &[u8],
        size_hint: usize,
        cancel: &CancellationToken,
    ) -> ObjectStoreResult<()>;

    async fn delete(&self, storage_id: Uuid) -> ObjectStoreResult<()>;

    async fn open_read(&self, storage_id: Uuid) -> ObjectStoreResult<ObjectReader>;

    async fn list(&self) -> ObjectStoreResult<Vec<ObjectSummary>>;

    /// Remove partial uploads last modified at or before `cutoff`, left
    /// behind by an interrupted process. Returns how many were removed.
    async fn purge_stale_uploads(&self, _cutoff: DateTime<Utc>) -> ObjectStoreResult<usize> {
        Ok(0)
    }

    /// Write/read/delete probe against the backing store.
    async fn health_check(&self) -> ObjectStoreResult<()>;
}

/// Local-disk bucket.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    /// Bucket root: `base_path/{bucket}`.
    root: PathBuf,
}

impl FsObjectStore {
    /// Bucket `bucket` under `base_path`. The directory is created lazily.
    pub fn new(base_path: impl Into<PathBuf>, bucket: &str) -> Self {
        let mut root = base_path.into();
        root.push(bucket);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Two-level shard names for a storage id: the first two bytes of
    /// MD5(id) as lowercase hex. Keeps directory fan-out bounded.
    fn object_shards(storage_id: Uuid) -> (String, String) {
        let digest = md5::compute(storage_id.to_string());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, storage_id: Uuid) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(storage_id);
        let mut path = self.root.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(storage_id.to_string());
        path
    }

    /// Create `path` inside shard directory `parent`. A concurrent delete can
    /// prune an empty shard between `create_dir_all` and the create, so the
    /// directory is recreated once on `NotFound`.
    async fn create_in_shard(parent: &Path, path: &Path) -> io::Result<File> {
        match File::create(path).await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(parent).await?;
                File::create(path).await
            }
            Err(err) => Err(err),
        }
    }

    /// Every second-level shard directory of the bucket.
    async fn shard_dirs(&self) -> ObjectStoreResult<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut level_a = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(dirs),
            Err(err) => return Err(err.into()),
        };

        while let Some(shard_a) = level_a.next_entry().await? {
            if !shard_a.file_type().await?.is_dir() {
                continue;
            }
            let mut level_b = fs::read_dir(shard_a.path()).await?;
            while let Some(shard_b) = level_b.next_entry().await? {
                if shard_b.file_type().await?.is_dir() {
                    dirs.push(shard_b.path());
                }
            }
        }
        Ok(dirs)
    }

    async fn write_chunks(
        file: &mut File,
        storage_id: Uuid,
        data: &[u8],
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> ObjectStoreResult<()> {
        for chunk in data.chunks(chunk_size) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ObjectStoreError::Cancelled(storage_id)),
                res = file.write_all(chunk) => res?,
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Remove empty shard directories up to the bucket root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn upload(
        &self,
        storage_id: Uuid,
        data: &[u8],
        size_hint: usize,
        cancel: &CancellationToken,
    ) -> ObjectStoreResult<()> {
        let chunk_size = if size_hint > 0 {
            size_hint
        } else {
            DEFAULT_UPLOAD_CHUNK_SIZE
        };

        let file_path = self.object_path(storage_id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ObjectStoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!("{TMP_PREFIX}{}", Uuid::new_v4()));
        let mut file = Self::create_in_shard(&parent, &tmp_path).await?;

        let written = Self::write_chunks(&mut file, storage_id, data, chunk_size, cancel).await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }

        debug!(%storage_id, size_bytes = data.len(), "stored object");
        Ok(())
    }

    async fn delete(&self, storage_id: Uuid) -> ObjectStoreResult<()> {
        let file_path = self.object_path(storage_id);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed object file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound(storage_id));
            }
            Err(err) => return Err(ObjectStoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn open_read(&self, storage_id: Uuid) -> ObjectStoreResult<ObjectReader> {
        let file_path = self.object_path(storage_id);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStoreError::NotFound(storage_id)
            } else {
                ObjectStoreError::Io(err)
            }
        })?;
        let size_bytes = file.metadata().await?.len();
        Ok(ObjectReader {
            reader: Box::new(file),
            size_bytes,
        })
    }

    async fn list(&self) -> ObjectStoreResult<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        for shard in self.shard_dirs().await? {
            let mut files = fs::read_dir(shard).await?;
            while let Some(entry) = files.next_entry().await? {
                let name = entry.file_name();
                let Some(storage_id) = name.to_str().and_then(|n| Uuid::parse_str(n).ok()) else {
                    continue;
                };
                let modified = entry.metadata().await?.modified()?;
                objects.push(ObjectSummary {
                    storage_id,
                    last_modified: DateTime::<Utc>::from(modified),
                });
            }
        }
        Ok(objects)
    }

    async fn purge_stale_uploads(&self, cutoff: DateTime<Utc>) -> ObjectStoreResult<usize> {
        let mut removed = 0;
        for shard in self.shard_dirs().await? {
            let mut files = fs::read_dir(&shard).await?;
            while let Some(entry) = files.next_entry().await? {
                let is_tmp = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(TMP_PREFIX));
                if !is_tmp {
                    continue;
                }
                let modified = DateTime::<Utc>::from(entry.metadata().await?.modified()?);
                if modified > cutoff {
                    continue;
                }
                match fs::remove_file(entry.path()).await {
                    Ok(()) => {
                        debug!("removed stale upload {}", entry.path().display());
                        removed += 1;
                    }
                    // renamed into place or removed by its own upload meanwhile
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            self.prune_empty_dirs(&shard).await;
        }
        Ok(removed)
    }

    async fn health_check(&self) -> ObjectStoreResult<()> {
        fs::create_dir_all(&self.root).await?;
        let probe = self.root.join(format!("{PROBE_PREFIX}{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let read_back = fs::read(&probe).await;
        // best-effort cleanup
        let _ = fs::remove_file(&probe).await;
        if read_back? != b"readyz" {
            return Err(ObjectStoreError::Io(io::Error::other("probe content mismatch")));
        }
        Ok(())
    }
}
