//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that pings the metadata store and storage backend

use crate::services::{blob_service::BlobService, error::BlobResult};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Cheap liveness probe; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// HTTP 200 when both backends answer, HTTP 503 otherwise. The body reports
/// each check under the backend's kind, e.g. `sqlite` and `local`.
pub async fn readyz(State(service): State<BlobService>) -> impl IntoResponse {
    let meta = service.metadata();
    let storage = service.storage();
    let (meta_result, storage_result) = tokio::join!(meta.ping(), storage.ping());

    let mut checks = HashMap::new();
    checks.insert(meta.kind(), CheckStatus::from(meta_result));
    checks.insert(storage.kind(), CheckStatus::from(storage_result));

    let overall_ok = checks.values().all(|check| check.ok);
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl From<BlobResult<()>> for CheckStatus {
    fn from(result: BlobResult<()>) -> Self {
        match result {
            Ok(()) => Self { ok: true, error: None },
            Err(err) => {
                tracing::warn!("readiness check failed: {}", err);
                Self {
                    ok: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}
