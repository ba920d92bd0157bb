//! BlobService: record lifecycle, ingestion and egress.
//!
//! The service owns no state of its own beyond handles to the configured
//! metadata store and storage backend. Every mutation of an existing id runs
//! under that id's [`KeyedLocks`] guard, so re-uploads, metadata updates and
//! deletes of one blob never interleave.

use crate::models::{blob::BlobRecord, caller::Caller, update::UpdateBlobRequest};
use crate::services::{
    error::{BlobError, BlobResult},
    ids::IdSource,
    locks::KeyedLocks,
    metadata::{MetadataStore, Page, QueryPage},
    query::PredicateSet,
    storage::{ByteStream, ContentLocator, StorageBackend, WriteOutcome},
};
use chrono::Utc;
use std::{io::ErrorKind, sync::Arc};
use tokio::fs::File;
use tracing::{debug, error, info, warn};

/// What an upload writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    /// Replace the content of an existing record.
    Existing(String),
    /// Create a record named after the uploaded file.
    New { name: String },
}

/// How a client gets at stored content.
#[derive(Debug)]
pub enum Download {
    Stream { record: BlobRecord, file: File },
    Redirect { record: BlobRecord, url: String },
}

#[derive(Clone)]
pub struct BlobService {
    meta: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageBackend>,
    ids: Arc<dyn IdSource>,
    locks: Arc<KeyedLocks>,
    max_upload_size: u64,
}

impl BlobService {
    pub fn new(
        meta: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageBackend>,
        ids: Arc<dyn IdSource>,
        max_upload_size: u64,
    ) -> Self {
        Self {
            meta,
            storage,
            ids,
            locks: Arc::new(KeyedLocks::new()),
            max_upload_size,
        }
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.meta.as_ref()
    }

    pub fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }

    pub fn max_upload_size(&self) -> u64 {
        self.max_upload_size
    }

    /// [`ingest`](Self::ingest) bounded by the configured upload limit.
    pub async fn upload(
        &self,
        caller: &Caller,
        target: UploadTarget,
        content: ByteStream,
        declared_content_type: Option<&str>,
    ) -> BlobResult<BlobRecord> {
        self.ingest(caller, target, content, declared_content_type, self.max_upload_size)
            .await
    }

    /// Stream `content` into the storage backend and commit the resulting
    /// record.
    ///
    /// A failed write leaves the committed record and its bytes untouched. A
    /// failed metadata commit removes the freshly written artifact again; if
    /// that also fails the error carries both causes.
    pub async fn ingest(
        &self,
        caller: &Caller,
        target: UploadTarget,
        content: ByteStream,
        declared_content_type: Option<&str>,
        size_limit: u64,
    ) -> BlobResult<BlobRecord> {
        let (mut record, _guard) = match target {
            UploadTarget::Existing(id) => {
                let guard = self.locks.lock(&id).await;
                let record = self.meta.get(&id).await?;
                ensure_owner(caller, &record, "upload to")?;
                (record, guard)
            }
            UploadTarget::New { name } => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(BlobError::ValidationFailed("name is required".into()));
                }
                let id = self.ids.next_id();
                let guard = self.locks.lock(&id).await;
                (BlobRecord::new(id, name, caller.id()), guard)
            }
        };

        let extension = record.extension();
        let outcome = match self
            .storage
            .write(&record.id, extension.as_deref(), content, size_limit)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("upload of {} failed: {}", record.id, err);
                return Err(err);
            }
        };
        debug!(
            "wrote {} bytes for {} to {} backend",
            outcome.size,
            record.id,
            self.storage.kind()
        );

        let previous_path = record.path.take();
        apply_outcome(&mut record, &outcome, declared_content_type);

        if let Err(err) = self.meta.put(&record).await {
            error!("committing metadata for {} failed: {}", record.id, err);
            return Err(self.compensate(&outcome.path, err).await);
        }
        info!(
            "committed {} ({} bytes, md5 {})",
            record.id, outcome.size, outcome.content_hash
        );

        if let Some(previous) = previous_path.filter(|p| *p != outcome.path) {
            self.discard_artifact(&previous).await;
        }
        Ok(record)
    }

    /// Remove an artifact that no committed record points at.
    async fn compensate(&self, path: &str, original: BlobError) -> BlobError {
        match self.storage.remove(path).await {
            Ok(()) | Err(BlobError::ObjectNotFound(_)) => {
                info!("rolled back orphaned artifact {}", path);
                original
            }
            Err(rollback) => {
                error!("rollback of orphaned artifact {} failed: {}", path, rollback);
                BlobError::RollbackFailed {
                    original: Box::new(original),
                    rollback: Box::new(rollback),
                }
            }
        }
    }

    /// Best-effort removal of a superseded artifact.
    async fn discard_artifact(&self, path: &str) {
        match self.storage.remove(path).await {
            Ok(()) => debug!("removed superseded artifact {}", path),
            Err(BlobError::ObjectNotFound(_)) => {}
            Err(err) => warn!("failed to remove superseded artifact {}: {}", path, err),
        }
    }

    /// Create (`id == None`) or partially update a record's metadata.
    pub async fn put_metadata(
        &self,
        caller: &Caller,
        id: Option<&str>,
        update: &UpdateBlobRequest,
    ) -> BlobResult<BlobRecord> {
        update
            .validate(id.is_none())
            .map_err(BlobError::ValidationFailed)?;

        let Some(id) = id else {
            let mut record = BlobRecord::new(self.ids.next_id(), "", caller.id());
            update.apply(&mut record);
            self.meta.put(&record).await?;
            info!("created metadata-only record {}", record.id);
            return Ok(record);
        };

        let _guard = self.locks.lock(id).await;
        let mut record = self.meta.get(id).await?;
        ensure_owner(caller, &record, "update")?;
        update.apply(&mut record);
        self.meta.put(&record).await?;
        info!("updated metadata of {}", id);
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> BlobResult<BlobRecord> {
        self.meta.get(id).await
    }

    /// Resolve a record's content for download.
    pub async fn open(&self, id: &str) -> BlobResult<Download> {
        let record = self.meta.get(id).await?;
        let Some(path) = record.path.clone() else {
            return Err(BlobError::NotFound(id.to_string()));
        };

        match self.storage.read_locator(&path).await? {
            ContentLocator::File(file_path) => {
                let file = File::open(&file_path).await.map_err(|err| {
                    if err.kind() == ErrorKind::NotFound {
                        BlobError::ObjectNotFound(path.clone())
                    } else {
                        BlobError::BackendReadFailed(format!("{}: {}", file_path.display(), err))
                    }
                })?;
                Ok(Download::Stream { record, file })
            }
            ContentLocator::Redirect(url) => Ok(Download::Redirect { record, url }),
        }
    }

    pub async fn query(&self, predicates: &PredicateSet, page: Page) -> BlobResult<QueryPage> {
        self.meta.query(predicates, page).await
    }

    /// Remove content, then metadata. A missing artifact does not stop the
    /// metadata removal, so a delete that failed half-way can be retried.
    pub async fn delete(&self, caller: &Caller, id: &str) -> BlobResult<BlobRecord> {
        let _guard = self.locks.lock(id).await;
        let record = self.meta.get(id).await?;
        ensure_owner(caller, &record, "delete")?;

        if let Some(path) = record.path.as_deref() {
            match self.storage.remove(path).await {
                Ok(()) => debug!("removed content of {} at {}", id, path),
                Err(BlobError::ObjectNotFound(_)) => {
                    warn!("content of {} at {} was already missing", id, path);
                }
                Err(err) => {
                    error!("removing content of {} failed: {}", id, err);
                    return Err(err);
                }
            }
        }

        if let Err(err) = self.meta.delete(id).await {
            error!("removing metadata of {} failed after content removal: {}", id, err);
            return Err(err);
        }
        info!("deleted {}", id);
        Ok(record)
    }
}

fn ensure_owner(caller: &Caller, record: &BlobRecord, action: &str) -> BlobResult<()> {
    if caller.owns(record) {
        return Ok(());
    }
    warn!(
        "caller {} may not {} {} owned by {}",
        caller.id(),
        action,
        record.id,
        record.author_id
    );
    Err(BlobError::PermissionDenied(format!(
        "`{}` may not {} blob `{}`",
        caller.id(),
        action,
        record.id
    )))
}

/// Content-derived fields of a successful write.
fn apply_outcome(record: &mut BlobRecord, outcome: &WriteOutcome, declared_content_type: Option<&str>) {
    record.size = Some(i64::try_from(outcome.size).unwrap_or(i64::MAX));
    record.content_hash = Some(outcome.content_hash.clone());
    record.path = Some(outcome.path.clone());
    record.upload_time = Some(Utc::now());
    record.content_type = Some(
        declared_content_type
            .map(str::trim)
            .filter(|ct| !ct.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| record.guessed_content_type()),
    );
}
