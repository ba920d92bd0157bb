//! HTTP handlers for blob operations.
//! Upload and download bodies are streamed; everything else is delegated to
//! `BlobService`.

use crate::{
    errors::AppError,
    models::{blob::DEFAULT_CONTENT_TYPE, caller::Caller, update::UpdateBlobRequest},
    services::{
        blob_service::{BlobService, Download, UploadTarget},
        metadata::{DEFAULT_LIMIT, Page},
        query::PredicateSet,
        storage::ByteStream,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{FromRequestParts, Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, convert::Infallible, io};
use tokio_util::io::ReaderStream;

/// Header carrying the identity resolved by the authenticating proxy.
pub const CALLER_HEADER: HeaderName = HeaderName::from_static("x-caller-id");

/// Id meaning "create" in `PUT /blobs/{id}`.
const CREATE_ID: &str = "_";

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .headers
            .get(&CALLER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(Caller::new)
            .unwrap_or_else(Caller::anonymous))
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub name: Option<String>,
}

/// One page of query results.
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub offset: usize,
    pub limit: usize,
}

/// `GET /blobs?q[field]=op=value&offset=&limit=`
pub async fn list_blobs(
    State(service): State<BlobService>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, AppError> {
    let (predicates, page) = parse_list_params(&params)?;
    let result = service.query(&predicates, page).await?;

    Ok(Json(ListResponse {
        data: result.records,
        total: result.total,
        offset: page.offset,
        limit: page.limit,
    }))
}

/// `POST /blobs?name=<file>`: upload content as a new blob.
pub async fn upload_new(
    State(service): State<BlobService>,
    caller: Caller,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let target = UploadTarget::New {
        name: params.name.unwrap_or_default(),
    };
    let record = service
        .upload(&caller, target, body_stream(body), declared_content_type(&headers))
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// `POST /blobs/{id}`: replace an existing blob's content.
pub async fn upload_existing(
    State(service): State<BlobService>,
    caller: Caller,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let target = UploadTarget::Existing(blob_id(&id).to_string());
    let record = service
        .upload(&caller, target, body_stream(body), declared_content_type(&headers))
        .await?;
    Ok(Json(record))
}

/// `GET /blobs/{id}`: stream content, or redirect to a pre-signed URL.
pub async fn download_blob(
    State(service): State<BlobService>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    match service.open(blob_id(&id)).await? {
        Download::Stream { record, file } => {
            let body = Body::from_stream(ReaderStream::new(file));
            let mut response = Response::new(body);
            *response.status_mut() = StatusCode::OK;

            let headers = response.headers_mut();
            let content_type = record.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(content_type)
                    .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
            );
            if let Some(size) = record.size {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size.max(0)));
            }
            headers.insert(header::CONTENT_DISPOSITION, content_disposition(&record.name));
            if let Some(hash) = record.content_hash.as_deref() {
                if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", hash)) {
                    headers.insert(header::ETAG, value);
                }
            }
            Ok(response)
        }
        Download::Redirect { url, .. } => {
            let location = HeaderValue::from_str(&url)
                .map_err(|err| AppError::internal(format!("invalid redirect target: {}", err)))?;
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::FOUND;
            response.headers_mut().insert(header::LOCATION, location);
            Ok(response)
        }
    }
}

/// `GET /blobs/{id}/meta`
pub async fn get_blob_meta(
    State(service): State<BlobService>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(service.get(blob_id(&id)).await?))
}

/// `PUT /blobs/{id}`: partial metadata update, or create when the id is `_`.
pub async fn put_blob_meta(
    State(service): State<BlobService>,
    caller: Caller,
    Path(id): Path<String>,
    Json(update): Json<UpdateBlobRequest>,
) -> Result<impl IntoResponse, AppError> {
    let id = blob_id(&id);
    if id == CREATE_ID {
        let record = service.put_metadata(&caller, None, &update).await?;
        return Ok((StatusCode::CREATED, Json(record)));
    }
    let record = service.put_metadata(&caller, Some(id), &update).await?;
    Ok((StatusCode::OK, Json(record)))
}

/// `DELETE /blobs/{id}`
pub async fn delete_blob(
    State(service): State<BlobService>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.delete(&caller, blob_id(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn body_stream(body: Body) -> ByteStream {
    body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other)).boxed()
}

fn declared_content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
}

/// `123.pdf` -> `123`
fn blob_id(raw: &str) -> &str {
    raw.split_once('.').map_or(raw, |(id, _)| id)
}

fn content_disposition(name: &str) -> HeaderValue {
    let safe: String = name
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", safe))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// Split raw list parameters into the predicate set and the page window.
fn parse_list_params(params: &HashMap<String, String>) -> Result<(PredicateSet, Page), AppError> {
    let number = |key: &str, default: usize| -> Result<usize, AppError> {
        match params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
            Some(value) => value
                .parse()
                .map_err(|_| AppError::bad_request(format!("`{}` must be a non-negative integer", key))),
            None => Ok(default),
        }
    };
    let page = Page::new(number("offset", 0)?, number("limit", DEFAULT_LIMIT)?);

    let conditions: HashMap<String, String> = params
        .iter()
        .filter_map(|(key, value)| {
            let field = key.strip_prefix("q[")?.strip_suffix(']')?;
            Some((field.to_string(), value.clone()))
        })
        .collect();
    let predicates = PredicateSet::from_encoded(&conditions)?;
    Ok((predicates, page))
}
