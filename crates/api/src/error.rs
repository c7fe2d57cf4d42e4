use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use taskhub_core::HubError;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("不支持的媒体类型: {0}")]
    UnsupportedMedia(String),

    #[error("未认证: {0}")]
    Unauthorized(String),

    #[error("禁止访问: {0}")]
    Forbidden(String),

    /// 未分页且结果过多；附带 X-Total 头
    #[error("结果数量过多 ({total})，请使用 limit 分页")]
    LimitRequired { total: String },
}

impl ApiError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        ApiError::BadRequest(reason.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Hub(err) => hub_status(err),
            ApiError::BadRequest(_)
            | ApiError::UnsupportedMedia(_)
            | ApiError::LimitRequired { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }
}

fn hub_status(err: &HubError) -> StatusCode {
    if err.is_validation() {
        return StatusCode::BAD_REQUEST;
    }
    if err.is_not_found() {
        return StatusCode::NOT_FOUND;
    }
    match err {
        HubError::Conflict(_) => StatusCode::CONFLICT,
        HubError::Database(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            StatusCode::CONFLICT
        }
        HubError::Forbidden(_) => StatusCode::FORBIDDEN,
        HubError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        HubError::Serialization(_) => StatusCode::BAD_REQUEST,
        HubError::Cluster(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "请求处理失败");
        }

        let mut response = (status, Json(json!({ "error": self.to_string() }))).into_response();
        if let ApiError::LimitRequired { total } = &self {
            if let Ok(value) = HeaderValue::from_str(total) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(crate::response::X_TOTAL), value);
            }
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use taskhub_core::models::TaskState;

    #[test]
    fn test_hub_error_status_mapping() {
        let cases = [
            (HubError::not_found("Task", 1), StatusCode::NOT_FOUND),
            (HubError::bad_request("filter"), StatusCode::BAD_REQUEST),
            (
                HubError::AddonNotFound("missing".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                HubError::IllegalTransition {
                    from: TaskState::Succeeded,
                    to: TaskState::Running,
                },
                StatusCode::BAD_REQUEST,
            ),
            (HubError::Conflict("report".into()), StatusCode::CONFLICT),
            (HubError::Forbidden("builtin".into()), StatusCode::FORBIDDEN),
            (
                HubError::Cluster("unreachable".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (HubError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_limit_required_carries_total_header() {
        let response = ApiError::LimitRequired {
            total: ">50000".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["x-total"], ">50000");
    }

    #[test]
    fn test_auth_errors() {
        assert_eq!(
            ApiError::Unauthorized("missing".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Forbidden("scope".into()).status(),
            StatusCode::FORBIDDEN
        );
    }
}
