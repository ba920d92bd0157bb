//! Tests for the HTTP boundary.

mod common;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use blob_store::routes::routes::routes;
use common::{Harness, md5_hex};
use serde_json::Value;
use tower::ServiceExt;

fn router(h: &Harness, prefix: &str) -> Router {
    routes(prefix).with_state(h.service.clone())
}

/// Send a request and return status, headers and raw body.
async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    caller: Option<&str>,
    body: Body,
    content_type: Option<&str>,
) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(caller) = caller {
        builder = builder.header("x-caller-id", caller);
    }
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    let response = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, bytes.to_vec())
}

fn json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap_or(Value::Null)
}

#[tokio::test]
async fn upload_download_and_delete() {
    let h = Harness::new(1024).await;
    let app = router(&h, "");

    let (status, _, body) = send(
        &app,
        "POST",
        "/blobs?name=hello.txt",
        Some("alice"),
        Body::from("hello world"),
        Some("text/plain"),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let record = json(&body);
    let id = record["id"].as_str().unwrap().to_string();
    assert_eq!(record["authorId"], "alice");
    assert_eq!(record["size"], 11);
    assert_eq!(record["contentHash"], md5_hex(b"hello world"));

    // The extension on the id is ignored.
    let (status, headers, body) =
        send(&app, "GET", &format!("/blobs/{}.txt", id), None, Body::empty(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello world");
    assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
    assert_eq!(headers[header::CONTENT_LENGTH], "11");
    assert_eq!(
        headers[header::ETAG].to_str().unwrap(),
        format!("\"{}\"", md5_hex(b"hello world"))
    );
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"hello.txt\""
    );

    let (status, _, body) =
        send(&app, "GET", &format!("/blobs/{}/meta", id), None, Body::empty(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["name"], "hello.txt");

    let (status, _, body) =
        send(&app, "DELETE", &format!("/blobs/{}", id), Some("bob"), Body::empty(), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json(&body)["code"], "PermissionDenied");

    let (status, _, _) =
        send(&app, "DELETE", &format!("/blobs/{}", id), Some("alice"), Body::empty(), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, body) =
        send(&app, "GET", &format!("/blobs/{}", id), None, Body::empty(), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["code"], "NotFound");
    assert_eq!(json(&body)["status"], 404);
}

#[tokio::test]
async fn oversize_upload_is_413() {
    let h = Harness::new(8).await;
    let app = router(&h, "");

    let (status, _, body) = send(
        &app,
        "POST",
        "/blobs?name=big.bin",
        None,
        Body::from(vec![0u8; 64]),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json(&body)["code"], "SizeLimitExceeded");
    assert!(h.stored_files().is_empty());
}

#[tokio::test]
async fn metadata_create_update_and_list() {
    let h = Harness::new(1024).await;
    let app = router(&h, "");

    let (status, _, body) = send(
        &app,
        "PUT",
        "/blobs/_",
        Some("alice"),
        Body::from(r#"{"name":"report.pdf","desc":"Q3"}"#),
        Some("application/json"),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = json(&body)["id"].as_str().unwrap().to_string();

    let (status, _, body) = send(
        &app,
        "PUT",
        &format!("/blobs/{}", id),
        Some("alice"),
        Body::from(r#"{"tags":"finance,q3","authorId":"mallory"}"#),
        Some("application/json"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let updated = json(&body);
    assert_eq!(updated["tags"], "finance,q3");
    assert_eq!(updated["name"], "report.pdf");
    assert_eq!(updated["authorId"], "alice");

    let (status, _, body) = send(
        &app,
        "PUT",
        "/blobs/_",
        Some("alice"),
        Body::from(r#"{"desc":"nameless"}"#),
        Some("application/json"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["code"], "ValidationFailed");

    let (status, _, body) = send(
        &app,
        "GET",
        "/blobs?q%5Btags%5D=text%3Dfinance&limit=5",
        None,
        Body::empty(),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let page = json(&body);
    assert_eq!(page["total"], 1);
    assert_eq!(page["offset"], 0);
    assert_eq!(page["limit"], 5);
    assert_eq!(page["data"][0]["id"], id.as_str());

    let (status, _, body) = send(
        &app,
        "GET",
        "/blobs?q%5Bname%5D=like%3Dreport",
        None,
        Body::empty(),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["code"], "UnsupportedOperator");
}

#[tokio::test]
async fn routes_nest_under_prefix() {
    let h = Harness::new(1024).await;
    let app = router(&h, "/api");

    let (status, _, _) = send(&app, "GET", "/api/healthz", None, Body::empty(), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&app, "GET", "/api/readyz", None, Body::empty(), None).await;
    assert_eq!(status, StatusCode::OK);
    let ready = json(&body);
    assert_eq!(ready["status"], "ok");
    assert_eq!(ready["checks"]["sqlite"]["ok"], true);
    assert_eq!(ready["checks"]["local"]["ok"], true);

    let (status, _, _) = send(&app, "GET", "/healthz", None, Body::empty(), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
