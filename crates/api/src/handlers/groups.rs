use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    Extension,
};
use serde_json::Value;
use taskhub_core::models::TaskGroup;
use taskhub_dispatcher::GroupDeletion;

use crate::auth::Principal;
use crate::error::ApiResult;
use crate::filter::ListParams;
use crate::response::{render, render_page, Format, OptionalPayload, Payload};
use crate::routes::AppState;

pub async fn list_groups(
    State(state): State<AppState>,
    format: Format,
    Query(params): Query<ListParams>,
) -> ApiResult<Response> {
    let query = params.to_query()?;
    let page = state.groups.list(&query).await?;
    render_page(format, &query, page)
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    format: Format,
    Payload(group): Payload<TaskGroup>,
) -> ApiResult<Response> {
    let group = state.groups.create(group, &principal.user()).await?;
    render(format, StatusCode::CREATED, &group)
}

pub async fn get_group(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    format: Format,
) -> ApiResult<Response> {
    let group = state.groups.get(id).await?;
    render(format, StatusCode::OK, &group)
}

pub async fn update_group(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Extension(principal): Extension<Principal>,
    format: Format,
    Payload(group): Payload<TaskGroup>,
) -> ApiResult<Response> {
    let group = state.groups.update(id, group, &principal.user()).await?;
    render(format, StatusCode::OK, &group)
}

pub async fn patch_group(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Extension(principal): Extension<Principal>,
    format: Format,
    Payload(patch): Payload<Value>,
) -> ApiResult<Response> {
    let group = state.groups.patch(id, &patch, &principal.user()).await?;
    render(format, StatusCode::OK, &group)
}

pub async fn submit_group(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Extension(principal): Extension<Principal>,
    format: Format,
    OptionalPayload(patch): OptionalPayload<Value>,
) -> ApiResult<Response> {
    let group = state
        .groups
        .submit(id, patch.as_ref(), &principal.user())
        .await?;
    render(format, StatusCode::OK, &group)
}

/// 成员全部终结时立即删除（204），否则取消成员并延迟删除（202）
pub async fn delete_group(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    match state.groups.delete(id).await? {
        GroupDeletion::Deleted => Ok(StatusCode::NO_CONTENT),
        GroupDeletion::Accepted => Ok(StatusCode::ACCEPTED),
    }
}
