use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use taskhub::{AppMode, Application, ShutdownManager};
use taskhub_core::AppConfig;
use taskhub_testing_utils::{cluster_config, manager_config, TestEnv};
use tempfile::TempDir;
use tower::ServiceExt;

async fn application(dir: &TempDir, mode: AppMode) -> Application {
    let mut config = AppConfig::default();
    config.database.url = format!("sqlite://{}", dir.path().join("hub.db").display());
    config.file.root = dir.path().join("file").display().to_string();
    config.bucket.root = dir.path().join("bucket").display().to_string();
    config.cluster = cluster_config(10);
    config.manager = manager_config(10);
    config.api.bind_address = "127.0.0.1:0".to_string();
    let prometheus = PrometheusBuilder::new().build_recorder().handle();
    Application::new(config, mode, Some(prometheus)).await.unwrap()
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_router_health_and_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let app = application(&dir, AppMode::Api).await;
    assert_eq!(app.mode(), AppMode::Api);
    let router = app.router();

    let (status, body) = call(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = call(&router, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_run_schedules_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let app = Arc::new(application(&dir, AppMode::All).await);
    let router = app.router();
    let shutdown = ShutdownManager::new();

    let runner = {
        let app = app.clone();
        let receiver = shutdown.subscribe();
        tokio::spawn(async move { app.run(receiver).await })
    };

    let (status, created) = call(
        &router,
        Method::POST,
        "/tasks",
        Some(json!({"name": "boot", "addon": "analyzer", "state": "Ready"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let uri = format!("/tasks/{}", created["id"]);

    let router_ref = &router;
    let uri_ref = uri.as_str();
    let scheduled = TestEnv::wait_for(
        || async move {
            let (_, task) = call(router_ref, Method::GET, uri_ref, None).await;
            task["state"] == "Pending"
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(scheduled, "任务未被调度");

    shutdown.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("关闭超时")
        .unwrap();
    assert!(result.is_ok());
}

#[test]
fn test_shipped_config_loads() {
    let config = AppConfig::load(Some("config/taskhub.toml")).unwrap();
    assert_eq!(config.cluster.addons[0].name, "analyzer");
    assert_eq!(config.cluster.kinds.len(), 2);
    assert_eq!(config.manager.kind_caps.get("analyze"), Some(&5));
    assert_eq!(config.api.bind_address, "0.0.0.0:8080");
}
