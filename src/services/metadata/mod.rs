//! Metadata stores persist and query blob records.
//!
//! Default result ordering is backend-dependent:
//! - [`sqlite::SqliteMetadataStore`]: `upload_time DESC` (records without
//!   content last), then `id DESC`.
//! - [`index::IndexMetadataStore`]: relevance (matched text terms) first, ties
//!   broken like the relational store.

pub mod index;
pub mod sqlite;

use crate::models::blob::BlobRecord;
use crate::services::error::BlobResult;
use crate::services::query::PredicateSet;
use async_trait::async_trait;
use serde::Serialize;

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 1000;

/// Offset/limit window over a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    /// Limits are clamped to `1..=MAX_LIMIT`.
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, MAX_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, DEFAULT_LIMIT)
    }
}

/// One page of matches plus the total match count.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPage {
    pub records: Vec<BlobRecord>,
    pub total: u64,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Short name used in logs and readiness output.
    fn kind(&self) -> &'static str;

    /// `NotFound` if no record has this id.
    async fn get(&self, id: &str) -> BlobResult<BlobRecord>;

    /// Upsert by id. Readers never observe a partially written record.
    async fn put(&self, record: &BlobRecord) -> BlobResult<()>;

    /// `NotFound` if no record has this id.
    async fn delete(&self, id: &str) -> BlobResult<()>;

    async fn query(&self, predicates: &PredicateSet, page: Page) -> BlobResult<QueryPage>;

    async fn ping(&self) -> BlobResult<()>;
}
