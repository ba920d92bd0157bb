//! Core data models for the blob store.
//!
//! `BlobRecord` is the sole persisted entity. It maps to the relational
//! table via `sqlx::FromRow` and serializes as camelCase JSON via `serde`.

pub mod blob;
pub mod caller;
pub mod update;
