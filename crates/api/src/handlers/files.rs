use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    Extension,
};
use taskhub_core::models::FileRecord;
use taskhub_core::HubError;
use tracing::{debug, warn};

use crate::auth::Principal;
use crate::error::ApiResult;
use crate::response::{raw, render, Format, Upload};
use crate::routes::AppState;

async fn load(state: &AppState, id: &str) -> ApiResult<FileRecord> {
    let id: i64 = id
        .parse()
        .map_err(|_| HubError::bad_request(format!("无效的文件 id: {id}")))?;
    Ok(state
        .gateway
        .files
        .get(id)
        .await?
        .ok_or_else(|| HubError::not_found("File", id))?)
}

pub async fn list_files(State(state): State<AppState>, format: Format) -> ApiResult<Response> {
    let files = state.gateway.files.list().await?;
    render(format, StatusCode::OK, &files)
}

/// `POST /files/{name}`：multipart 或原始请求体
pub async fn create_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Extension(principal): Extension<Principal>,
    format: Format,
    upload: Upload,
) -> ApiResult<Response> {
    let encoding = upload.content_type.unwrap_or_default();
    let record = state
        .gateway
        .files
        .create(&name, &encoding, state.files.root(), &principal.user())
        .await?;
    if let Err(e) = state.files.write(&record, &upload.content).await {
        if let Err(cleanup) = state.gateway.files.delete(record.id).await {
            warn!(file.id = record.id, error = %cleanup, "回滚文件记录失败");
        }
        return Err(e.into());
    }
    debug!(file.id = record.id, name = %record.name, size = upload.content.len(), "文件已创建");
    render(format, StatusCode::CREATED, &record)
}

/// 追加内容
pub async fn append_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    format: Format,
    upload: Upload,
) -> ApiResult<Response> {
    let record = load(&state, &id).await?;
    state.files.append(&record, &upload.content).await?;
    render(format, StatusCode::OK, &record)
}

pub async fn get_file(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let record = load(&state, &id).await?;
    let content = state.files.read(&record).await?;
    Ok(raw(&record.encoding, content))
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let record = load(&state, &id).await?;
    state.files.remove(&record).await?;
    state.gateway.files.delete(record.id).await?;
    Ok(StatusCode::NO_CONTENT)
}
