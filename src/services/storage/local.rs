//! Local filesystem backend.
//!
//! Objects live beneath `root/{shard}/{shard}/{id}/{revision}{ext}`. Shards are
//! the first two bytes of md5(id) so no directory grows unbounded. Writes go to
//! a hidden temp file next to the target, are fsynced, then renamed into place.

use super::{
    ByteStream, ContentLocator, ContentMeter, StorageBackend, WriteOutcome, ensure_locator_safe,
    new_revision, revision_name, source_error,
};
use crate::services::error::{BlobError, BlobResult};
use async_trait::async_trait;
use futures::StreamExt;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Use `root` as the storage directory, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> BlobResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|err| write_failed(&root, err))?;
        Ok(Self { root })
    }

    /// Two-level shard identifiers for an object id.
    fn shards(id: &str) -> (String, String) {
        let digest = md5::compute(id);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn relative_path(id: &str, revision: &str, extension: Option<&str>) -> String {
        let (shard_a, shard_b) = Self::shards(id);
        format!(
            "{}/{}/{}",
            shard_a,
            shard_b,
            revision_name(id, revision, extension)
        )
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Copy the source into `tmp_path`, returning `(size, hash)`.
    async fn stream_to(
        tmp_path: &Path,
        mut content: ByteStream,
        max_bytes: u64,
    ) -> BlobResult<(u64, String)> {
        let mut file = File::create(tmp_path)
            .await
            .map_err(|err| write_failed(tmp_path, err))?;
        let mut meter = ContentMeter::new(max_bytes);

        while let Some(chunk) = content.next().await {
            let chunk = chunk.map_err(source_error)?;
            meter.accept(&chunk)?;
            file.write_all(&chunk)
                .await
                .map_err(|err| write_failed(tmp_path, err))?;
        }
        file.flush()
            .await
            .map_err(|err| write_failed(tmp_path, err))?;
        file.sync_all()
            .await
            .map_err(|err| write_failed(tmp_path, err))?;

        Ok(meter.finish())
    }

    /// Remove a failed write's temp file and any directories it left empty.
    async fn discard(&self, tmp_path: &Path) {
        match fs::remove_file(tmp_path).await {
            Ok(()) => debug!("removed partial file {}", tmp_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove partial file {}: {}", tmp_path.display(), err),
        }
        if let Some(parent) = tmp_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
    }

    /// Recursively remove empty directories up to the storage root.
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
impl StorageBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn write(
        &self,
        id: &str,
        extension: Option<&str>,
        content: ByteStream,
        max_bytes: u64,
    ) -> BlobResult<WriteOutcome> {
        let relative = Self::relative_path(id, &new_revision(), extension);
        ensure_locator_safe(&relative)
            .map_err(|_| BlobError::BackendWriteFailed(format!("unsafe locator `{}`", relative)))?;

        let file_path = self.absolute(&relative);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BlobError::BackendWriteFailed("object path missing parent directory".into())
        })?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| write_failed(&parent, err))?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut guard = PartialFile::new(tmp_path.clone());

        let (size, content_hash) = match Self::stream_to(&tmp_path, content, max_bytes).await {
            Ok(done) => done,
            Err(err) => {
                self.discard(&tmp_path).await;
                guard.disarm();
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            self.discard(&tmp_path).await;
            guard.disarm();
            return Err(write_failed(&file_path, err));
        }
        guard.disarm();

        debug!("stored {} bytes at {}", size, file_path.display());
        Ok(WriteOutcome {
            size,
            content_hash,
            path: relative,
        })
    }

    async fn read_locator(&self, path: &str) -> BlobResult<ContentLocator> {
        ensure_locator_safe(path)?;
        let file_path = self.absolute(path);
        match fs::metadata(&file_path).await {
            Ok(meta) if meta.is_file() => Ok(ContentLocator::File(file_path)),
            Ok(_) => Err(BlobError::ObjectNotFound(path.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BlobError::ObjectNotFound(path.to_string()))
            }
            Err(err) => Err(BlobError::BackendReadFailed(format!(
                "{}: {}",
                file_path.display(),
                err
            ))),
        }
    }

    async fn remove(&self, path: &str) -> BlobResult<()> {
        ensure_locator_safe(path)?;
        let file_path = self.absolute(path);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BlobError::ObjectNotFound(path.to_string()));
            }
            Err(err) => return Err(write_failed(&file_path, err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn ping(&self) -> BlobResult<()> {
        let probe = self.root.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz")
            .await
            .map_err(|err| write_failed(&probe, err))?;
        let read = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        match read {
            Ok(bytes) if bytes == b"readyz" => Ok(()),
            Ok(_) => Err(BlobError::BackendReadFailed("probe content mismatch".into())),
            Err(err) => Err(BlobError::BackendReadFailed(format!(
                "{}: {}",
                probe.display(),
                err
            ))),
        }
    }
}

fn write_failed(path: &Path, err: io::Error) -> BlobError {
    BlobError::BackendWriteFailed(format!("{}: {}", path.display(), err))
}

/// Removes a temp file if the write future is dropped before it finishes.
struct PartialFile {
    path: Option<PathBuf>,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("removed abandoned upload {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!("failed to remove abandoned upload {}: {}", path.display(), err),
            }
        }
    }
}
