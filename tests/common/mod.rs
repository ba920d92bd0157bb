//! Common test utilities and fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use blob_store::{
    models::blob::BlobRecord,
    services::{
        blob_service::BlobService,
        error::{BlobError, BlobResult},
        ids::UuidV7Ids,
        metadata::{MetadataStore, Page, QueryPage, sqlite::SqliteMetadataStore},
        query::PredicateSet,
        storage::{
            ByteStream, ContentLocator, StorageBackend, WriteOutcome, local::LocalBackend,
        },
    },
};
use bytes::Bytes;
use futures::StreamExt;
use object_store::{path::Path as ObjectPath, signer::Signer};
use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use url::Url;

/// Stream `data` in chunks of `chunk` bytes.
pub fn stream_of(data: &[u8], chunk: usize) -> ByteStream {
    let chunks: Vec<io::Result<Bytes>> = data
        .chunks(chunk.max(1))
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    futures::stream::iter(chunks).boxed()
}

/// Yields `data`, then fails like a dropped connection.
pub fn broken_stream(data: &[u8]) -> ByteStream {
    let items: Vec<io::Result<Bytes>> = vec![
        Ok(Bytes::copy_from_slice(data)),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
    ];
    futures::stream::iter(items).boxed()
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Every regular file beneath `root`.
pub fn files_under(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found
}

/// Read back stored content at a local locator.
pub async fn read_local(storage: &dyn StorageBackend, path: &str) -> Vec<u8> {
    match storage.read_locator(path).await.unwrap() {
        ContentLocator::File(file) => std::fs::read(file).unwrap(),
        ContentLocator::Redirect(url) => panic!("expected a local file, got redirect to {}", url),
    }
}

/// Issues deterministic URLs instead of real signatures.
#[derive(Debug)]
pub struct FakeSigner;

#[async_trait]
impl Signer for FakeSigner {
    async fn signed_url(
        &self,
        method: axum::http::Method,
        path: &ObjectPath,
        expires_in: Duration,
    ) -> object_store::Result<Url> {
        Url::parse(&format!(
            "https://signed.test/{}?method={}&expires={}",
            path,
            method,
            expires_in.as_secs()
        ))
        .map_err(|err| object_store::Error::Generic {
            store: "fake",
            source: Box::new(err),
        })
    }
}

/// Metadata store that can be told to fail `put`.
pub struct FlakyMeta {
    pub inner: Arc<dyn MetadataStore>,
    pub fail_puts: AtomicBool,
}

impl FlakyMeta {
    pub fn new(inner: Arc<dyn MetadataStore>) -> Self {
        Self {
            inner,
            fail_puts: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MetadataStore for FlakyMeta {
    fn kind(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, id: &str) -> BlobResult<BlobRecord> {
        self.inner.get(id).await
    }

    async fn put(&self, record: &BlobRecord) -> BlobResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BlobError::Index("injected put failure".into()));
        }
        self.inner.put(record).await
    }

    async fn delete(&self, id: &str) -> BlobResult<()> {
        self.inner.delete(id).await
    }

    async fn query(&self, predicates: &PredicateSet, page: Page) -> BlobResult<QueryPage> {
        self.inner.query(predicates, page).await
    }

    async fn ping(&self) -> BlobResult<()> {
        self.inner.ping().await
    }
}

/// Storage backend that can be told to fail `remove`.
pub struct StickyStorage {
    pub inner: Arc<dyn StorageBackend>,
    pub fail_removes: AtomicBool,
}

#[async_trait]
impl StorageBackend for StickyStorage {
    fn kind(&self) -> &'static str {
        "sticky"
    }

    async fn write(
        &self,
        id: &str,
        extension: Option<&str>,
        content: ByteStream,
        max_bytes: u64,
    ) -> BlobResult<WriteOutcome> {
        self.inner.write(id, extension, content, max_bytes).await
    }

    async fn read_locator(&self, path: &str) -> BlobResult<ContentLocator> {
        self.inner.read_locator(path).await
    }

    async fn remove(&self, path: &str) -> BlobResult<()> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(BlobError::BackendWriteFailed("injected remove failure".into()));
        }
        self.inner.remove(path).await
    }

    async fn ping(&self) -> BlobResult<()> {
        self.inner.ping().await
    }
}

/// A service over a temp-dir local backend and an in-memory SQLite store.
pub struct Harness {
    pub service: BlobService,
    pub meta: Arc<dyn MetadataStore>,
    pub storage: Arc<dyn StorageBackend>,
    pub storage_root: PathBuf,
    _dir: TempDir,
}

impl Harness {
    pub async fn new(max_upload_size: u64) -> Self {
        let meta: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::in_memory().await.unwrap());
        Self::with_meta(meta, max_upload_size).await
    }

    pub async fn with_meta(meta: Arc<dyn MetadataStore>, max_upload_size: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage_root = dir.path().join("blobs");
        let local = LocalBackend::open(&storage_root).await.unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(local);
        Self::assemble(meta, storage, storage_root, dir, max_upload_size)
    }

    pub fn assemble(
        meta: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageBackend>,
        storage_root: PathBuf,
        dir: TempDir,
        max_upload_size: u64,
    ) -> Self {
        let service = BlobService::new(
            meta.clone(),
            storage.clone(),
            Arc::new(UuidV7Ids),
            max_upload_size,
        );
        Self {
            service,
            meta,
            storage,
            storage_root,
            _dir: dir,
        }
    }

    pub fn stored_files(&self) -> Vec<PathBuf> {
        files_under(&self.storage_root)
    }
}
