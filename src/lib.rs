//! Blob storage service: streamed ingestion into pluggable storage backends,
//! searchable metadata, and a thin HTTP boundary.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
