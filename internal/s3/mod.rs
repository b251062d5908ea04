use crate::api::AppState;
use crate::obs::MetricsLayer;
use crate::s3::errors::{s3_error, S3Error};
use crate::sandbox::http::SandboxLayer;
use crate::util::time::now_utc;
use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use md5::{Digest, Md5};
use std::collections::HashMap;

pub mod errors;
pub mod xml;

pub const COPY_SOURCE_HEADER: &str = "x-amz-copy-source";

const MAX_BODY_BYTES: usize = 128 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", any(root_handler))
        .route("/{*path}", any(path_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(SandboxLayer)
        .layer(MetricsLayer::new(state.metrics.clone()))
        .with_state(state)
}

async fn root_handler(State(state): State<AppState>, method: Method) -> Response {
    if method != Method::GET {
        return plain_not_found();
    }
    let response = handle_list_buckets(&state).await.unwrap_or_else(s3_error);
    record_s3_request(&state, "ListBuckets", response.status());
    response
}

async fn path_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    body: Body,
) -> Response {
    let Some(bucket_key) = parse_bucket_key(&path) else {
        return s3_error(S3Error::InvalidRequest);
    };
    let query: HashMap<String, String> =
        serde_urlencoded::from_str(raw_query.as_deref().unwrap_or_default()).unwrap_or_default();
    let op = detect_s3_operation(&method, bucket_key.key.is_some(), &query, &headers);
    let response = dispatch(&state, &bucket_key, method, headers, &query, body).await;
    record_s3_request(&state, op, response.status());
    response
}

#[derive(Debug, Clone)]
struct BucketKey {
    bucket: String,
    key: Option<String>,
}

/// Splits a request path into bucket and object key; everything after the
/// first `/` is the key, slashes included.
fn parse_bucket_key(path: &str) -> Option<BucketKey> {
    let trimmed = path.trim_start_matches('/');
    let mut parts = trimmed.splitn(2, '/');
    let bucket = parts.next().unwrap_or("").to_string();
    let key = parts.next().filter(|key| !key.is_empty()).map(ToString::to_string);
    if bucket.is_empty() {
        return None;
    }
    Some(BucketKey { bucket, key })
}

fn detect_s3_operation(
    method: &Method,
    has_key: bool,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> &'static str {
    if has_key {
        return match *method {
            Method::PUT if headers.contains_key(COPY_SOURCE_HEADER) => "CopyObject",
            Method::PUT => "PutObject",
            Method::GET => "GetObject",
            Method::HEAD => "HeadObject",
            Method::DELETE => "DeleteObject",
            _ => "Unknown",
        };
    }
    match *method {
        Method::PUT => "CreateBucket",
        Method::DELETE => "DeleteBucket",
        Method::GET if query.get("list-type").map(String::as_str) == Some("2") => "ListObjectsV2",
        Method::GET => "ListObjects",
        Method::HEAD => "HeadBucket",
        Method::POST if query.contains_key("delete") => "DeleteObjects",
        _ => "Unknown",
    }
}

async fn dispatch(
    state: &AppState,
    bucket_key: &BucketKey,
    method: Method,
    headers: HeaderMap,
    query: &HashMap<String, String>,
    body: Body,
) -> Response {
    match &bucket_key.key {
        Some(key) => dispatch_object(state, &bucket_key.bucket, key, method, headers, body).await,
        None => dispatch_bucket(state, &bucket_key.bucket, method, query, body).await,
    }
}

async fn dispatch_bucket(
    state: &AppState,
    bucket: &str,
    method: Method,
    query: &HashMap<String, String>,
    body: Body,
) -> Response {
    match method {
        Method::PUT => handle_create_bucket(state, bucket)
            .await
            .unwrap_or_else(s3_error),
        Method::DELETE => handle_delete_bucket(state, bucket)
            .await
            .unwrap_or_else(s3_error),
        Method::GET => handle_list_objects(state, bucket, query)
            .await
            .unwrap_or_else(s3_error),
        // HEAD reuses the list handler: copied status, body dropped.
        Method::HEAD => strip_body(
            handle_list_objects(state, bucket, query)
                .await
                .unwrap_or_else(s3_error),
        ),
        Method::POST if query.contains_key("delete") => {
            handle_delete_objects(state, bucket, body)
                .await
                .unwrap_or_else(s3_error)
        }
        _ => plain_not_found(),
    }
}

async fn dispatch_object(
    state: &AppState,
    bucket: &str,
    key: &str,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    match method {
        Method::PUT => handle_put_object(state, bucket, key, &headers, body)
            .await
            .unwrap_or_else(s3_error),
        Method::GET => handle_get_object(state, bucket, key)
            .await
            .unwrap_or_else(s3_error),
        // HEAD reuses GET: headers (Content-Length included) survive, the
        // body does not.
        Method::HEAD => strip_body(
            handle_get_object(state, bucket, key)
                .await
                .unwrap_or_else(s3_error),
        ),
        Method::DELETE => handle_delete_object(state, bucket, key)
            .await
            .unwrap_or_else(s3_error),
        _ => plain_not_found(),
    }
}

async fn handle_list_buckets(state: &AppState) -> Result<Response, S3Error> {
    let buckets = state.storage.list_buckets().await?;
    Ok(xml_ok_response(xml::list_buckets(&buckets)))
}

async fn handle_create_bucket(state: &AppState, bucket: &str) -> Result<Response, S3Error> {
    state.storage.create_bucket(bucket).await?;
    Ok((
        StatusCode::OK,
        [("Location", format!("/{bucket}"))],
        "",
    )
        .into_response())
}

async fn handle_delete_bucket(state: &AppState, bucket: &str) -> Result<Response, S3Error> {
    state.storage.delete_bucket(bucket).await?;
    Ok((StatusCode::NO_CONTENT, "").into_response())
}

async fn handle_list_objects(
    state: &AppState,
    bucket: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let objects = state.storage.list_objects(bucket).await?;
    let prefix = query.get("prefix").map(String::as_str).unwrap_or("");
    let filtered: Vec<_> = objects
        .into_iter()
        .filter(|object| object.key.starts_with(prefix))
        .collect();
    let body = if query.get("list-type").map(String::as_str) == Some("2") {
        xml::list_objects_v2(bucket, &filtered)
    } else {
        xml::list_objects(bucket, &filtered)
    };
    Ok(xml_ok_response(body))
}

async fn handle_put_object(
    state: &AppState,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    if let Some(source) = copy_source(headers)? {
        return handle_copy_object(state, bucket, key, source).await;
    }
    let bytes = read_body_limited(body, MAX_BODY_BYTES).await?;
    let etag = payload_etag(&bytes);
    state.storage.put_object(bucket, key, bytes).await?;
    Ok(etag_response(&etag))
}

/// Source named by `x-amz-copy-source`: optional leading slash, then the
/// bucket and key split at the first slash.
fn copy_source(headers: &HeaderMap) -> Result<Option<(String, String)>, S3Error> {
    let Some(value) = headers.get(COPY_SOURCE_HEADER) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| S3Error::InvalidRequest)?;
    let trimmed = value.strip_prefix('/').unwrap_or(value);
    let mut parts = trimmed.splitn(2, '/');
    let bucket = parts.next().unwrap_or("");
    let key = parts.next().unwrap_or("");
    if bucket.is_empty() || key.is_empty() {
        return Err(S3Error::InvalidRequest);
    }
    Ok(Some((bucket.to_string(), key.to_string())))
}

async fn handle_copy_object(
    state: &AppState,
    bucket: &str,
    key: &str,
    source: (String, String),
) -> Result<Response, S3Error> {
    let (source_bucket, source_key) = source;
    let bytes = state.storage.get_object(&source_bucket, &source_key).await?;
    let etag = payload_etag(&bytes);
    state.storage.put_object(bucket, key, bytes).await?;
    Ok(xml_ok_response(xml::copy_object_result(&etag, now_utc())))
}

async fn handle_get_object(state: &AppState, bucket: &str, key: &str) -> Result<Response, S3Error> {
    let bytes = state.storage.get_object(bucket, key).await?;
    let content_length = bytes.len();
    let mut response = (StatusCode::OK, Body::from(bytes)).into_response();
    response.headers_mut().insert(
        "Content-Type",
        "application/octet-stream".parse().map_err(|_| S3Error::InternalError)?,
    );
    response.headers_mut().insert(
        "Content-Length",
        content_length
            .to_string()
            .parse()
            .map_err(|_| S3Error::InternalError)?,
    );
    Ok(response)
}

async fn handle_delete_object(
    state: &AppState,
    bucket: &str,
    key: &str,
) -> Result<Response, S3Error> {
    match state.storage.delete_object(bucket, key).await {
        // Deleting a missing key still answers 204; S3 deletes are
        // idempotent at the HTTP layer.
        Ok(()) | Err(crate::storage::StorageError::NoSuchKey) => {}
        Err(err) => return Err(err.into()),
    }
    Ok((StatusCode::NO_CONTENT, "").into_response())
}

async fn handle_delete_objects(
    state: &AppState,
    bucket: &str,
    body: Body,
) -> Result<Response, S3Error> {
    let bytes = read_body_limited(body, MAX_BODY_BYTES).await?;
    let keys = xml::parse_delete_objects(&bytes).map_err(|_| S3Error::MalformedXML)?;
    for key in &keys {
        let _ = state.storage.delete_object(bucket, key).await;
    }
    Ok(xml_ok_response(xml::delete_result(&keys)))
}

fn payload_etag(bytes: &[u8]) -> String {
    format!("{:x}", Md5::digest(bytes))
}

fn etag_response(etag: &str) -> Response {
    (StatusCode::OK, [("ETag", format!("\"{etag}\""))], "").into_response()
}

fn xml_ok_response(body: String) -> Response {
    (StatusCode::OK, [("Content-Type", "application/xml")], body).into_response()
}

fn plain_not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

fn strip_body(response: Response) -> Response {
    let (parts, _) = response.into_parts();
    Response::from_parts(parts, Body::empty())
}

async fn read_body_limited(body: Body, limit: usize) -> Result<Bytes, S3Error> {
    to_bytes(body, limit)
        .await
        .map_err(|_| S3Error::InvalidRequest)
}

fn record_s3_request(state: &AppState, op: &str, status: StatusCode) {
    state
        .metrics
        .s3_requests
        .with_label_values(&[op, status.as_str()])
        .inc();
}
