//! Represents a stored blob and its searchable metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::Path;

/// Content type used when neither the request nor the filename tells us better.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Metadata describing one stored blob.
///
/// Content-derived fields (`size`, `path`, `content_hash`, `upload_time`) are
/// only ever set by the ingestion pipeline. They stay `None` for metadata-only
/// records that have not received their first upload yet.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlobRecord {
    /// Opaque unique identifier, assigned once at creation.
    pub id: String,

    /// Display filename.
    pub name: String,

    /// Free-text description.
    #[serde(alias = "desc", default)]
    pub description: String,

    /// Free-text categories.
    #[serde(default)]
    pub categories: String,

    /// Free-text tags.
    #[serde(default)]
    pub tags: String,

    /// MIME type of the content.
    pub content_type: Option<String>,

    /// Byte length of the last committed content.
    pub size: Option<i64>,

    /// Backend-specific storage locator.
    pub path: Option<String>,

    /// Hex md5 of the last committed content.
    #[serde(alias = "md5")]
    pub content_hash: Option<String>,

    /// When content was last committed.
    pub upload_time: Option<DateTime<Utc>>,

    /// Identity of the owner. Never changed after creation.
    pub author_id: String,

    /// Visibility flag.
    #[serde(default)]
    pub is_public: bool,
}

impl BlobRecord {
    /// A fresh metadata-only record owned by `author_id`.
    pub fn new(id: impl Into<String>, name: impl Into<String>, author_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            categories: String::new(),
            tags: String::new(),
            content_type: None,
            size: None,
            path: None,
            content_hash: None,
            upload_time: None,
            author_id: author_id.into(),
            is_public: false,
        }
    }

    /// Whether the record has committed content.
    pub fn has_content(&self) -> bool {
        self.path.is_some()
    }

    /// Filename extension including the leading dot, e.g. `.pdf`.
    ///
    /// Only short alphanumeric extensions are returned since the result ends up
    /// in backend locators.
    pub fn extension(&self) -> Option<String> {
        let ext = Path::new(&self.name).extension()?.to_str()?;
        if ext.is_empty() || ext.len() > 16 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(format!(".{}", ext.to_ascii_lowercase()))
    }

    /// Content type guessed from the filename extension alone.
    pub fn guessed_content_type(&self) -> String {
        mime_guess::from_path(&self.name)
            .first_raw()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string()
    }
}
