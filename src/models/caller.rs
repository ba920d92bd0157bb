//! Caller identity as resolved by the authentication layer.

use super::blob::BlobRecord;

/// The identity a request acts as.
///
/// An empty identity means ownership checks are disabled (anonymous or admin
/// mode). Any other value must match a record's `author_id` to mutate it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller(String);

impl Caller {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    /// Caller with ownership checks disabled.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this caller may update or delete `record`.
    pub fn owns(&self, record: &BlobRecord) -> bool {
        self.is_anonymous() || record.author_id == self.0
    }
}
