//! # Taskhub API
//!
//! 任务编排核心的 REST 接口，基于 Axum 构建。
//!
//! ## API 端点
//!
//! ### 任务
//! - `GET /tasks`、`POST /tasks`
//! - `GET|PUT|PATCH|DELETE /tasks/{id}`（`GET ?merged=true` 合并附件内容）
//! - `PUT /tasks/{id}/submit`、`PUT /tasks/{id}/cancel`、`PUT /tasks/cancel/list`
//! - `GET /tasks/report/queue`、`GET /tasks/report/dashboard`
//! - `GET|POST|PUT|DELETE /tasks/{id}/report`、`PUT /tasks/{id}/report/{action}`
//! - `GET /tasks/{id}/attached`
//! - `* /tasks/{id}/bucket/{path}`
//!
//! ### 任务组
//! - `GET|POST /taskgroups`、`GET|PUT|PATCH|DELETE /taskgroups/{id}`
//! - `PUT /taskgroups/{id}/submit`、`* /taskgroups/{id}/bucket/{path}`
//!
//! ### Bucket 与文件
//! - `GET|POST /buckets`、`GET|DELETE /buckets/{id}`、`* /buckets/{id}/{path}`
//! - `GET /files`、`POST /files/{name}`、`GET|PUT|PATCH|DELETE /files/{id}`
//!
//! ### 系统
//! - `GET /health`、指标端点（默认 `/metrics`）
//!
//! ## 约定
//!
//! - 请求与响应默认 JSON，`Accept`/`Content-Type` 为 YAML 时使用 YAML
//! - 列表接口支持 `?filter=`、`?limit=`、`?offset=`，`X-Total` 头返回总数
//! - 错误响应体为 `{"error": "..."}`

pub mod auth;
pub mod error;
pub mod filter;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use std::time::Duration;

use axum::{extract::DefaultBodyLimit, Router};
use taskhub_core::config::ApiConfig;
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer};

use middleware::{cors_layer, request_logging, trace_layer};
pub use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(state: AppState, config: &ApiConfig) -> Router {
    let router = create_routes(state)
        .layer(DefaultBodyLimit::max(config.max_request_size_mb * 1024 * 1024));

    let router = if config.cors_enabled {
        router.layer(cors_layer(config))
    } else {
        router
    };

    router.layer(
        ServiceBuilder::new()
            .layer(CatchPanicLayer::new())
            .layer(trace_layer())
            .layer(TimeoutLayer::new(Duration::from_secs(
                config.request_timeout_seconds,
            )))
            .layer(axum::middleware::from_fn(request_logging)),
    )
}
