//! 令牌认证
//!
//! 启用认证后请求需携带 `Authorization: Bearer <token>`：
//! 管理员令牌拥有全部权限；任务令牌只能访问 `/tasks/{其任务 id}/...` 和文件接口。

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::error::ApiError;
use crate::routes::AppState;

pub const BEARER_PREFIX: &str = "Bearer ";

/// 请求主体
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// 认证关闭
    Anonymous,
    Admin,
    Task(i64),
}

impl Principal {
    /// 写入 createUser/updateUser 的用户名
    pub fn user(&self) -> String {
        match self {
            Principal::Anonymous => String::new(),
            Principal::Admin => "admin".to_string(),
            Principal::Task(id) => format!("task:{id}"),
        }
    }
}

pub fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix(BEARER_PREFIX)
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// 任务令牌可访问的路径
pub fn task_scope_allows(task_id: i64, path: &str) -> bool {
    if path == "/files" || path.starts_with("/files/") {
        return true;
    }
    let own = format!("/tasks/{task_id}");
    path == own || path.starts_with(&format!("{own}/"))
}

fn is_public(state: &AppState, path: &str) -> bool {
    path == "/health" || path == state.metrics_endpoint
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path().to_string();
    let principal = if !state.hub.auth_enabled || is_public(&state, &path) {
        Principal::Anonymous
    } else {
        let token = bearer(req.headers())
            .ok_or_else(|| ApiError::Unauthorized("缺少认证令牌".into()))?
            .to_string();
        authenticate(&state, &token, &path).await?
    };
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

async fn authenticate(state: &AppState, token: &str, path: &str) -> Result<Principal, ApiError> {
    if state.hub.admin_token.as_deref() == Some(token) {
        return Ok(Principal::Admin);
    }
    match state.gateway.tasks.find_by_token(token).await? {
        Some(task_id) if task_scope_allows(task_id, path) => Ok(Principal::Task(task_id)),
        Some(task_id) => {
            warn!(task.id = task_id, path, "任务令牌越权访问");
            Err(ApiError::Forbidden(format!("任务 {task_id} 的令牌无权访问 {path}")))
        }
        None => {
            warn!(path, "未知的认证令牌");
            Err(ApiError::Unauthorized("认证令牌无效".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_task_scope() {
        assert!(task_scope_allows(7, "/tasks/7"));
        assert!(task_scope_allows(7, "/tasks/7/report/activity"));
        assert!(task_scope_allows(7, "/files/3"));
        assert!(task_scope_allows(7, "/files"));
        assert!(!task_scope_allows(7, "/tasks/70"));
        assert!(!task_scope_allows(7, "/tasks/8/report"));
        assert!(!task_scope_allows(7, "/taskgroups/1"));
        assert!(!task_scope_allows(7, "/tasks"));
    }

    #[test]
    fn test_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer(&headers), Some("abc"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer(&headers), None);
    }

    #[test]
    fn test_principal_user() {
        assert_eq!(Principal::Task(4).user(), "task:4");
        assert_eq!(Principal::Admin.user(), "admin");
        assert!(Principal::Anonymous.user().is_empty());
    }
}
