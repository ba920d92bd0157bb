use uuid::Uuid;

/// Source of new, never-reused blob ids.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> String;
}

/// Time-ordered UUIDv7 ids in simple (hyphen-less) form.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV7Ids;

impl IdSource for UuidV7Ids {
    fn next_id(&self) -> String {
        Uuid::now_v7().simple().to_string()
    }
}
