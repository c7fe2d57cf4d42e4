//! Bucket 内容读写
//!
//! 任务、任务组和独立 bucket 共用同一组内容操作：
//! 目录 GET 在 `Accept: text/html` 时返回索引页，否则返回 gzip TAR（`?filter=glob` 过滤）；
//! PUT/POST 上传文件，带 `Directory: Expand` 头时请求体为需要解压的 gzip TAR。

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    Extension,
};
use serde::Deserialize;
use taskhub_core::models::Bucket;
use taskhub_core::HubError;
use taskhub_infrastructure::{BucketEntry, StructuredLogger};

use crate::auth::Principal;
use crate::error::ApiResult;
use crate::response::{raw, render, Format, Upload};
use crate::routes::AppState;

pub const DIRECTORY: &str = "directory";
pub const EXPAND: &str = "Expand";

#[derive(Debug, Deserialize)]
pub struct ContentPath {
    pub id: i64,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContentParams {
    pub filter: Option<String>,
}

async fn get_content(
    state: &AppState,
    bucket: &Bucket,
    rel: &str,
    headers: &HeaderMap,
    filter: Option<String>,
) -> ApiResult<Response> {
    match state.buckets.stat(bucket, rel).await? {
        BucketEntry::File(path) => {
            let content = tokio::fs::read(&path).await.map_err(HubError::from)?;
            Ok(raw("application/octet-stream", content))
        }
        BucketEntry::Directory(path) => {
            let wants_html = headers
                .get(header::ACCEPT)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.contains("text/html"));
            if wants_html {
                let html = state.buckets.index_html(&path, rel).await?;
                return Ok(Html(html).into_response());
            }
            let archive = state.buckets.archive(path, filter).await?;
            let mut response = raw("application/x-gzip", archive);
            response.headers_mut().insert(
                HeaderName::from_static(DIRECTORY),
                HeaderValue::from_static(EXPAND),
            );
            Ok(response)
        }
    }
}

async fn put_content(
    state: &AppState,
    bucket: &Bucket,
    rel: &str,
    headers: &HeaderMap,
    upload: Upload,
) -> ApiResult<StatusCode> {
    let expand = headers
        .get(DIRECTORY)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(EXPAND));
    if expand {
        state
            .buckets
            .expand(bucket, rel, upload.content.to_vec())
            .await?;
        StructuredLogger::log_bucket_op(bucket.id, "expand", rel);
    } else {
        state.buckets.write_file(bucket, rel, &upload.content).await?;
        StructuredLogger::log_bucket_op(bucket.id, "put", rel);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_content(state: &AppState, bucket: &Bucket, rel: &str) -> ApiResult<StatusCode> {
    state.buckets.delete(bucket, rel).await?;
    state.buckets.ensure(bucket).await?;
    StructuredLogger::log_bucket_op(bucket.id, "delete", rel);
    Ok(StatusCode::NO_CONTENT)
}

async fn standalone(state: &AppState, id: i64) -> ApiResult<Bucket> {
    let bucket = state
        .gateway
        .buckets
        .get(id)
        .await?
        .ok_or_else(|| HubError::not_found("Bucket", id))?;
    state.buckets.ensure(&bucket).await?;
    Ok(bucket)
}

// 任务 bucket

pub async fn get_task_content(
    State(state): State<AppState>,
    Path(p): Path<ContentPath>,
    Query(params): Query<ContentParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let bucket = state.tasks.bucket(p.id).await?;
    get_content(&state, &bucket, &p.path, &headers, params.filter).await
}

pub async fn put_task_content(
    State(state): State<AppState>,
    Path(p): Path<ContentPath>,
    headers: HeaderMap,
    upload: Upload,
) -> ApiResult<StatusCode> {
    let bucket = state.tasks.bucket(p.id).await?;
    put_content(&state, &bucket, &p.path, &headers, upload).await
}

pub async fn delete_task_content(
    State(state): State<AppState>,
    Path(p): Path<ContentPath>,
) -> ApiResult<StatusCode> {
    let bucket = state.tasks.bucket(p.id).await?;
    delete_content(&state, &bucket, &p.path).await
}

// 任务组 bucket

pub async fn get_group_content(
    State(state): State<AppState>,
    Path(p): Path<ContentPath>,
    Query(params): Query<ContentParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let bucket = state.groups.bucket(p.id).await?;
    get_content(&state, &bucket, &p.path, &headers, params.filter).await
}

pub async fn put_group_content(
    State(state): State<AppState>,
    Path(p): Path<ContentPath>,
    headers: HeaderMap,
    upload: Upload,
) -> ApiResult<StatusCode> {
    let bucket = state.groups.bucket(p.id).await?;
    put_content(&state, &bucket, &p.path, &headers, upload).await
}

pub async fn delete_group_content(
    State(state): State<AppState>,
    Path(p): Path<ContentPath>,
) -> ApiResult<StatusCode> {
    let bucket = state.groups.bucket(p.id).await?;
    delete_content(&state, &bucket, &p.path).await
}

// 独立 bucket

pub async fn list_buckets(State(state): State<AppState>, format: Format) -> ApiResult<Response> {
    let buckets = state.gateway.buckets.list().await?;
    render(format, StatusCode::OK, &buckets)
}

/// 新建的独立 bucket 不被任何任务引用，由 bucket 回收器在 TTL 后清理
pub async fn create_bucket(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    format: Format,
) -> ApiResult<Response> {
    let bucket = state
        .gateway
        .buckets
        .create(state.buckets.root(), &principal.user())
        .await?;
    state.buckets.ensure(&bucket).await?;
    StructuredLogger::log_bucket_op(bucket.id, "create", &bucket.path);
    render(format, StatusCode::CREATED, &bucket)
}

pub async fn get_bucket_content(
    State(state): State<AppState>,
    Path(p): Path<ContentPath>,
    Query(params): Query<ContentParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let bucket = standalone(&state, p.id).await?;
    get_content(&state, &bucket, &p.path, &headers, params.filter).await
}

pub async fn put_bucket_content(
    State(state): State<AppState>,
    Path(p): Path<ContentPath>,
    headers: HeaderMap,
    upload: Upload,
) -> ApiResult<StatusCode> {
    let bucket = standalone(&state, p.id).await?;
    put_content(&state, &bucket, &p.path, &headers, upload).await
}

pub async fn delete_bucket_content(
    State(state): State<AppState>,
    Path(p): Path<ContentPath>,
) -> ApiResult<StatusCode> {
    let bucket = standalone(&state, p.id).await?;
    delete_content(&state, &bucket, &p.path).await
}

pub async fn delete_bucket(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let bucket = standalone(&state, id).await?;
    state.buckets.delete(&bucket, "").await?;
    state.gateway.buckets.delete(id).await?;
    StructuredLogger::log_bucket_op(id, "delete", &bucket.path);
    Ok(StatusCode::NO_CONTENT)
}
