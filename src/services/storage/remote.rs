//! Remote object-store backend (S3 and compatible).
//!
//! The bucket API wants either a known length or a multipart session, so a
//! write runs two tasks joined by a bounded channel: a spawned producer that
//! reads the source through a [`ContentMeter`], and a consumer that feeds a
//! `WriteMultipart`. The write only succeeds when both do.

use super::{
    ByteStream, ContentLocator, ContentMeter, StorageBackend, WriteOutcome, ensure_locator_safe,
    new_revision, revision_name, source_error,
};
use crate::services::error::{BlobError, BlobResult};
use async_trait::async_trait;
use axum::http::Method;
use bytes::Bytes;
use futures::StreamExt;
use object_store::{
    ObjectStore, WriteMultipart, aws::AmazonS3Builder, path::Path as ObjectPath, signer::Signer,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lifetime of pre-signed download URLs.
pub const PRESIGN_TTL: Duration = Duration::from_secs(15 * 60);

/// Chunks buffered between the producer and the uploader.
const PIPE_DEPTH: usize = 8;

/// Parts allowed in flight per upload.
const MAX_IN_FLIGHT_PARTS: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct S3Options {
    pub bucket: String,
    pub prefix: String,
    pub region: Option<String>,
    /// Custom endpoint for MinIO-style deployments.
    pub endpoint: Option<String>,
    pub allow_http: bool,
}

pub struct RemoteBackend {
    store: Arc<dyn ObjectStore>,
    signer: Arc<dyn Signer>,
    prefix: String,
}

enum Piece {
    Data(Bytes),
    /// The producer drained the source without error.
    End,
}

/// Why the producer stopped.
enum ProduceError {
    Failed(BlobError),
    /// The uploader hung up; its own result carries the cause.
    PipeClosed,
}

impl From<BlobError> for ProduceError {
    fn from(err: BlobError) -> Self {
        ProduceError::Failed(err)
    }
}

impl RemoteBackend {
    pub fn new(store: Arc<dyn ObjectStore>, signer: Arc<dyn Signer>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            signer,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Build an S3 client. Credentials come from the usual `AWS_*` variables.
    pub fn s3(options: &S3Options) -> BlobResult<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&options.bucket);
        if let Some(region) = &options.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &options.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if options.allow_http {
            builder = builder.with_allow_http(true);
        }
        let s3 = Arc::new(
            builder
                .build()
                .map_err(|err| BlobError::BackendWriteFailed(format!("configuring S3: {}", err)))?,
        );
        debug!(
            bucket = %options.bucket,
            prefix = %options.prefix,
            "Created S3 storage backend"
        );
        Ok(Self::new(s3.clone(), s3, options.prefix.clone()))
    }

    fn key(&self, id: &str, revision: &str, extension: Option<&str>) -> String {
        let name = revision_name(id, revision, extension);
        if self.prefix.is_empty() {
            name
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    /// Read the source, meter it, and hand chunks to the uploader.
    async fn produce(
        mut content: ByteStream,
        tx: mpsc::Sender<Piece>,
        max_bytes: u64,
    ) -> Result<(u64, String), ProduceError> {
        let mut meter = ContentMeter::new(max_bytes);
        while let Some(chunk) = content.next().await {
            let chunk = chunk.map_err(source_error)?;
            meter.accept(&chunk)?;
            if tx.send(Piece::Data(chunk)).await.is_err() {
                return Err(ProduceError::PipeClosed);
            }
        }
        if tx.send(Piece::End).await.is_err() {
            return Err(ProduceError::PipeClosed);
        }
        Ok(meter.finish())
    }

    /// Drain the pipe into a multipart upload, aborting unless the producer
    /// signals a clean end.
    async fn consume(
        store: Arc<dyn ObjectStore>,
        path: ObjectPath,
        mut rx: mpsc::Receiver<Piece>,
    ) -> BlobResult<()> {
        let upload = store
            .put_multipart(&path)
            .await
            .map_err(|err| remote_write_failed(&path, err))?;
        let mut pending = PendingUpload(Some(WriteMultipart::new(upload)));

        loop {
            match rx.recv().await {
                Some(Piece::Data(bytes)) => {
                    let writer = pending.writer()?;
                    if let Err(err) = writer.wait_for_capacity(MAX_IN_FLIGHT_PARTS).await {
                        pending.abort().await;
                        return Err(remote_write_failed(&path, err));
                    }
                    writer.write(&bytes);
                }
                Some(Piece::End) => {
                    let writer = pending.take()?;
                    writer
                        .finish()
                        .await
                        .map_err(|err| remote_write_failed(&path, err))?;
                    return Ok(());
                }
                None => {
                    pending.abort().await;
                    return Err(BlobError::BackendWriteFailed(format!(
                        "upload of `{}` abandoned by producer",
                        path
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl StorageBackend for RemoteBackend {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn write(
        &self,
        id: &str,
        extension: Option<&str>,
        content: ByteStream,
        max_bytes: u64,
    ) -> BlobResult<WriteOutcome> {
        let key = self.key(id, &new_revision(), extension);
        ensure_locator_safe(&key)
            .map_err(|_| BlobError::BackendWriteFailed(format!("unsafe locator `{}`", key)))?;
        let path = ObjectPath::from(key.as_str());

        let (tx, rx) = mpsc::channel(PIPE_DEPTH);
        let producer = tokio::spawn(Self::produce(content, tx, max_bytes));
        let uploader = Self::consume(self.store.clone(), path.clone(), rx);

        let (produced, uploaded) = tokio::join!(producer, uploader);
        let produced = produced.unwrap_or_else(|err| {
            Err(ProduceError::Failed(BlobError::BackendWriteFailed(format!(
                "upload producer failed: {}",
                err
            ))))
        });

        match (produced, uploaded) {
            (Ok((size, content_hash)), Ok(())) => {
                debug!("stored {} bytes at {}", size, key);
                Ok(WriteOutcome {
                    size,
                    content_hash,
                    path: key,
                })
            }
            (Ok(_), Err(upload_err)) | (Err(ProduceError::PipeClosed), Err(upload_err)) => {
                warn!("upload to {} failed: {}", key, upload_err);
                Err(upload_err)
            }
            (Err(ProduceError::PipeClosed), Ok(())) => Err(BlobError::BackendWriteFailed(format!(
                "upload of `{}` closed before the source was drained",
                key
            ))),
            // A failed producer abandons the upload, which the uploader reports too.
            (Err(ProduceError::Failed(produce_err)), uploaded) => {
                if let Err(upload_err) = uploaded {
                    debug!("upload to {} aborted: {}", key, upload_err);
                }
                Err(produce_err)
            }
        }
    }

    async fn read_locator(&self, path: &str) -> BlobResult<ContentLocator> {
        ensure_locator_safe(path)?;
        let location = ObjectPath::from(path);
        match self.store.head(&location).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => {
                return Err(BlobError::ObjectNotFound(path.to_string()));
            }
            Err(err) => return Err(BlobError::BackendReadFailed(format!("{}: {}", path, err))),
        }

        let url = self
            .signer
            .signed_url(Method::GET, &location, PRESIGN_TTL)
            .await
            .map_err(|err| BlobError::BackendReadFailed(format!("presigning {}: {}", path, err)))?;
        Ok(ContentLocator::Redirect(url.to_string()))
    }

    async fn remove(&self, path: &str) -> BlobResult<()> {
        ensure_locator_safe(path)?;
        let location = ObjectPath::from(path);
        match self.store.delete(&location).await {
            Ok(()) => {
                debug!("removed remote object {}", path);
                Ok(())
            }
            Err(object_store::Error::NotFound { .. }) => {
                debug!("remote object {} already missing", path);
                Ok(())
            }
            Err(err) => Err(remote_write_failed(&location, err)),
        }
    }

    async fn ping(&self) -> BlobResult<()> {
        let probe = if self.prefix.is_empty() {
            ObjectPath::from(".readyz")
        } else {
            ObjectPath::from(format!("{}/.readyz", self.prefix))
        };
        match self.store.head(&probe).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(BlobError::BackendReadFailed(err.to_string())),
        }
    }
}

fn remote_write_failed(path: &ObjectPath, err: object_store::Error) -> BlobError {
    BlobError::BackendWriteFailed(format!("{}: {}", path, err))
}

/// Owns an in-progress multipart upload and aborts it if dropped unfinished,
/// e.g. when the client disconnects mid-upload.
struct PendingUpload(Option<WriteMultipart>);

impl PendingUpload {
    fn writer(&mut self) -> BlobResult<&mut WriteMultipart> {
        self.0
            .as_mut()
            .ok_or_else(|| BlobError::BackendWriteFailed("multipart upload already closed".into()))
    }

    fn take(&mut self) -> BlobResult<WriteMultipart> {
        self.0
            .take()
            .ok_or_else(|| BlobError::BackendWriteFailed("multipart upload already closed".into()))
    }

    async fn abort(&mut self) {
        if let Some(writer) = self.0.take() {
            if let Err(err) = writer.abort().await {
                warn!("failed to abort multipart upload: {}", err);
            }
        }
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if let Some(writer) = self.0.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(err) = writer.abort().await {
                        warn!("failed to abort abandoned multipart upload: {}", err);
                    }
                });
            }
        }
    }
}
