//! Partial metadata updates sent by clients.

use super::blob::BlobRecord;
use serde::Deserialize;

/// Client-settable metadata fields.
///
/// Absent fields are left untouched. Content-derived fields, `id` and
/// `authorId` are not part of this type and cannot be set by clients.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBlobRequest {
    pub name: Option<String>,
    #[serde(alias = "desc")]
    pub description: Option<String>,
    pub categories: Option<String>,
    pub tags: Option<String>,
    pub content_type: Option<String>,
    pub is_public: Option<bool>,
}

impl UpdateBlobRequest {
    /// Shape checks that do not need the stored record.
    ///
    /// `creating` requires a name since a new record must be displayable.
    pub fn validate(&self, creating: bool) -> Result<(), String> {
        match self.name.as_deref().map(str::trim) {
            Some("") => Err("name must not be empty".into()),
            None if creating => Err("name is required".into()),
            _ => Ok(()),
        }
    }

    pub fn apply(&self, record: &mut BlobRecord) {
        if let Some(name) = &self.name {
            record.name = name.trim().to_string();
        }
        if let Some(description) = &self.description {
            record.description = description.clone();
        }
        if let Some(categories) = &self.categories {
            record.categories = categories.clone();
        }
        if let Some(tags) = &self.tags {
            record.tags = tags.clone();
        }
        if let Some(content_type) = &self.content_type {
            record.content_type = Some(content_type.clone()).filter(|ct| !ct.is_empty());
        }
        if let Some(is_public) = self.is_public {
            record.is_public = is_public;
        }
    }
}
