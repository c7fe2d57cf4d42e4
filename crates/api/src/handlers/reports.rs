use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde_json::{Map, Value};
use taskhub_core::models::{ReportOp, TaskReport};

use crate::error::{ApiError, ApiResult};
use crate::response::{render, Format, OptionalPayload, Payload};
use crate::routes::AppState;

pub async fn get_report(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    format: Format,
) -> ApiResult<Response> {
    let report = state.reports.get(id).await?;
    render(format, StatusCode::OK, &report)
}

pub async fn create_report(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    format: Format,
    Payload(report): Payload<TaskReport>,
) -> ApiResult<Response> {
    let report = state.reports.create(id, report).await?;
    render(format, StatusCode::CREATED, &report)
}

pub async fn replace_report(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    format: Format,
    Payload(report): Payload<TaskReport>,
) -> ApiResult<Response> {
    let report = state.reports.replace(id, report).await?;
    render(format, StatusCode::OK, &report)
}

pub async fn delete_report(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.reports.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /tasks/{id}/report/{action}`：请求体为该操作的参数
pub async fn report_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(i64, String)>,
    OptionalPayload(body): OptionalPayload<Value>,
) -> ApiResult<StatusCode> {
    let op = parse_op(&action, body)?;
    state.reports.apply(id, op).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_op(action: &str, body: Option<Value>) -> ApiResult<ReportOp> {
    let mut fields = match body {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        // activity 允许直接提交字符串数组
        Some(Value::Array(entries)) if action == "activity" => {
            Map::from_iter([("entries".to_string(), Value::Array(entries))])
        }
        Some(_) => {
            return Err(ApiError::bad_request(format!(
                "上报操作 {action} 的请求体必须是对象"
            )))
        }
    };
    fields.insert("op".to_string(), Value::String(action.to_string()));
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| ApiError::bad_request(format!("无效的上报操作 {action}: {e}")))
}
