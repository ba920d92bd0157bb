//! Error taxonomy shared by the storage backends, metadata stores and the
//! blob service.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("content exceeds the upload limit of {limit} bytes")]
    SizeLimitExceeded { limit: u64 },
    #[error("backend write failed: {0}")]
    BackendWriteFailed(String),
    #[error("backend read failed: {0}")]
    BackendReadFailed(String),
    #[error("stored object `{0}` not found")]
    ObjectNotFound(String),
    #[error("unsupported query operator `{operator}` for field `{field}`")]
    UnsupportedOperator { field: String, operator: String },
    #[error("invalid query value for field `{field}`: {reason}")]
    InvalidQueryValue { field: String, reason: String },
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("search index: {0}")]
    Index(String),
    #[error("{original}; rollback also failed: {rollback}")]
    RollbackFailed {
        original: Box<BlobError>,
        rollback: Box<BlobError>,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

impl BlobError {
    /// Stable taxonomy value reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            BlobError::NotFound(_) => "NotFound",
            BlobError::PermissionDenied(_) => "PermissionDenied",
            BlobError::SizeLimitExceeded { .. } => "SizeLimitExceeded",
            BlobError::BackendWriteFailed(_) => "BackendWriteFailed",
            BlobError::BackendReadFailed(_) => "BackendReadFailed",
            BlobError::ObjectNotFound(_) => "ObjectNotFound",
            BlobError::UnsupportedOperator { .. } => "UnsupportedOperator",
            BlobError::InvalidQueryValue { .. } => "InvalidQueryValue",
            BlobError::ValidationFailed(_) => "ValidationFailed",
            BlobError::Index(_) | BlobError::Sqlx(_) => "MetadataStoreFailed",
            // The original failure is what the caller needs to act on.
            BlobError::RollbackFailed { original, .. } => original.code(),
        }
    }

    pub(crate) fn invalid_value(field: &str, reason: impl Into<String>) -> Self {
        BlobError::InvalidQueryValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_failure_keeps_both_errors() {
        let err = BlobError::RollbackFailed {
            original: Box::new(BlobError::Index("journal append failed".into())),
            rollback: Box::new(BlobError::BackendWriteFailed("disk gone".into())),
        };
        let message = err.to_string();
        assert!(message.contains("journal append failed"));
        assert!(message.contains("disk gone"));
        assert_eq!(err.code(), "MetadataStoreFailed");
    }
}
