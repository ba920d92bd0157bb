pub mod blob_service;
pub mod error;
pub mod ids;
pub mod locks;
pub mod metadata;
pub mod query;
pub mod storage;
