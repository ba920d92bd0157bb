//! Defines routes for blob operations.
//!
//! ## Structure
//! - **Collection endpoints**
//!   - `GET    /blobs`: query records (`q[field]=op=value`, `offset`, `limit`)
//!   - `POST   /blobs?name=<file>`: upload content as a new blob
//!
//! - **Blob endpoints** (`{id}` may carry a trailing extension, e.g. `123.pdf`)
//!   - `POST   /blobs/{id}`: re-upload content
//!   - `GET    /blobs/{id}`: download (stream or 302 redirect)
//!   - `GET    /blobs/{id}/meta`: metadata only
//!   - `PUT    /blobs/{id}`: update metadata; `_` creates a metadata-only record
//!   - `DELETE /blobs/{id}`: delete content and metadata

use crate::{
    handlers::{
        blob_handlers::{
            delete_blob, download_blob, get_blob_meta, list_blobs, put_blob_meta,
            upload_existing, upload_new,
        },
        health_handlers::{healthz, readyz},
    },
    services::blob_service::BlobService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router, nested under `prefix` when it is non-empty.
///
/// Upload size is enforced while streaming by the service, so axum's default
/// body limit is disabled.
pub fn routes(prefix: &str) -> Router<BlobService> {
    let api = Router::new()
        // health endpoints
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/blobs", get(list_blobs).post(upload_new))
        .route(
            "/blobs/{id}",
            post(upload_existing)
                .get(download_blob)
                .put(put_blob_meta)
                .delete(delete_blob),
        )
        .route("/blobs/{id}/meta", get(get_blob_meta))
        .layer(DefaultBodyLimit::disable());

    if prefix.is_empty() {
        api
    } else {
        Router::new().nest(prefix, api)
    }
}
