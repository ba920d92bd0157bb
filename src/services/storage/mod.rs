//! Storage backends persist blob bytes.
//!
//! The metadata store is the only source of truth for which objects exist;
//! backends never list. Every write streams the source exactly once through a
//! [`ContentMeter`], which enforces the size limit and accumulates the md5 in
//! the same pass as the sink write.

pub mod local;
pub mod remote;

use crate::services::error::{BlobError, BlobResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::{io, path::PathBuf};
use uuid::Uuid;

/// Source of upload bytes of a priori unknown length.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Result of a completed backend write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub size: u64,
    /// Hex md5 of the bytes written.
    pub content_hash: String,
    /// Locator to store in the record's `path`.
    pub path: String,
}

/// Where content can be read back from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentLocator {
    /// Local file to stream from.
    File(PathBuf),
    /// Time-bounded URL the client must be redirected to.
    Redirect(String),
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs and readiness output.
    fn kind(&self) -> &'static str;

    /// Stream `content` into a fresh locator derived from `id` and `extension`.
    ///
    /// Fails with `SizeLimitExceeded` once more than `max_bytes` arrive. No
    /// partial artifact survives a failed write.
    async fn write(
        &self,
        id: &str,
        extension: Option<&str>,
        content: ByteStream,
        max_bytes: u64,
    ) -> BlobResult<WriteOutcome>;

    /// Resolve a stored locator for reading. `ObjectNotFound` if absent.
    async fn read_locator(&self, path: &str) -> BlobResult<ContentLocator>;

    async fn remove(&self, path: &str) -> BlobResult<()>;

    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> BlobResult<()>;
}

/// Enforces the upload limit and hashes content while it streams past.
pub struct ContentMeter {
    limit: u64,
    written: u64,
    digest: md5::Context,
}

impl ContentMeter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            written: 0,
            digest: md5::Context::new(),
        }
    }

    /// Account for `chunk` before it is handed to the sink.
    pub fn accept(&mut self, chunk: &[u8]) -> BlobResult<()> {
        let next = self.written + chunk.len() as u64;
        if next > self.limit {
            return Err(BlobError::SizeLimitExceeded { limit: self.limit });
        }
        self.written = next;
        self.digest.consume(chunk);
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Consume the meter, returning `(size, hex md5)`.
    pub fn finish(self) -> (u64, String) {
        (self.written, format!("{:x}", self.digest.compute()))
    }
}

/// Map a source read failure to the write taxonomy.
pub(crate) fn source_error(err: io::Error) -> BlobError {
    BlobError::BackendWriteFailed(format!("reading upload stream: {}", err))
}

/// A locator segment that is unique per upload so re-uploads never overwrite
/// the bytes a committed record points at.
pub(crate) fn new_revision() -> String {
    Uuid::now_v7().simple().to_string()
}

/// `{id}/{revision}{ext}`
pub(crate) fn revision_name(id: &str, revision: &str, extension: Option<&str>) -> String {
    format!("{}/{}{}", id, revision, extension.unwrap_or(""))
}

/// Reject locators that could escape the backend root.
///
/// IDs come from the identifier source and extensions are sanitized, so any
/// violation here means a corrupted or hand-edited record.
pub(crate) fn ensure_locator_safe(path: &str) -> BlobResult<()> {
    if path.is_empty()
        || path.len() > 1024
        || path.starts_with('/')
        || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        || path.bytes().any(|b| b.is_ascii_control() || b == b'\\')
    {
        return Err(BlobError::ObjectNotFound(path.to_string()));
    }
    Ok(())
}
