use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension,
};
use serde::Deserialize;
use serde_json::Value;
use taskhub_core::models::Task;

use crate::auth::Principal;
use crate::error::ApiResult;
use crate::filter::ListParams;
use crate::response::{render, render_page, Format, OptionalPayload, Payload};
use crate::routes::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct GetParams {
    #[serde(default)]
    pub merged: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueParams {
    pub addon: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    format: Format,
    Query(params): Query<ListParams>,
) -> ApiResult<Response> {
    let query = params.to_query()?;
    let page = state.tasks.list(&query).await?;
    render_page(format, &query, page)
}

pub async fn create_task(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    format: Format,
    Payload(task): Payload<Task>,
) -> ApiResult<Response> {
    let task = state.tasks.create(task, &principal.user()).await?;
    render(format, StatusCode::CREATED, &task)
}

/// `?merged=true` 时将附件内容合并进上报的 activity
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<GetParams>,
    format: Format,
) -> ApiResult<Response> {
    let task = if params.merged {
        state.tasks.get_merged(id).await?
    } else {
        state.tasks.get(id).await?
    };
    render(format, StatusCode::OK, &task)
}

pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Extension(principal): Extension<Principal>,
    format: Format,
    Payload(task): Payload<Task>,
) -> ApiResult<Response> {
    let task = state.tasks.update(id, task, &principal.user()).await?;
    render(format, StatusCode::OK, &task)
}

pub async fn patch_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Extension(principal): Extension<Principal>,
    format: Format,
    Payload(patch): Payload<Value>,
) -> ApiResult<Response> {
    let task = state.tasks.patch(id, &patch, &principal.user()).await?;
    render(format, StatusCode::OK, &task)
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.tasks.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn submit_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Extension(principal): Extension<Principal>,
    format: Format,
    OptionalPayload(patch): OptionalPayload<Value>,
) -> ApiResult<Response> {
    let task = state
        .tasks
        .submit(id, patch.as_ref(), &principal.user())
        .await?;
    render(format, StatusCode::OK, &task)
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.tasks.cancel(id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// 按过滤条件批量取消
pub async fn cancel_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Response> {
    let query = params.to_query()?;
    let canceled = state.tasks.cancel_list(&query).await?;
    Ok((
        StatusCode::ACCEPTED,
        [(crate::response::X_TOTAL, canceled.to_string())],
    )
        .into_response())
}

pub async fn queue_report(
    State(state): State<AppState>,
    format: Format,
    Query(params): Query<QueueParams>,
) -> ApiResult<Response> {
    let report = state.tasks.queue(params.addon.as_deref()).await?;
    render(format, StatusCode::OK, &report)
}

pub async fn dashboard(
    State(state): State<AppState>,
    format: Format,
    Query(params): Query<ListParams>,
) -> ApiResult<Response> {
    let query = params.to_query()?;
    let page = state.tasks.dashboard(&query).await?;
    render_page(format, &query, page)
}

/// 附件打包为 TAR
pub async fn attached(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Response> {
    let tar = state.tasks.attached_tar(id).await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-tar".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"task-{id}-attached.tar\""),
            ),
        ],
        tar,
    )
        .into_response())
}
