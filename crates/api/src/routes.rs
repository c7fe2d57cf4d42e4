use axum::{
    middleware::from_fn_with_state,
    routing::{get, put},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use taskhub_core::config::HubConfig;
use taskhub_dispatcher::{GroupService, PersistenceGateway, ReportService, TaskService};
use taskhub_infrastructure::{BucketStore, Database, FileStore};

use crate::auth::auth_middleware;
use crate::handlers::{buckets, files, groups, health, reports, tasks};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub gateway: PersistenceGateway,
    pub tasks: TaskService,
    pub groups: GroupService,
    pub reports: ReportService,
    pub files: FileStore,
    pub buckets: BucketStore,
    pub hub: HubConfig,
    pub metrics_endpoint: String,
    pub prometheus: Option<PrometheusHandle>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    let metrics_endpoint = state.metrics_endpoint.clone();

    Router::new()
        .route("/health", get(health::health_check))
        .route(&metrics_endpoint, get(health::metrics))
        // 任务
        .route("/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/tasks/cancel/list", put(tasks::cancel_tasks))
        .route("/tasks/report/queue", get(tasks::queue_report))
        .route("/tasks/report/dashboard", get(tasks::dashboard))
        .route(
            "/tasks/{id}",
            get(tasks::get_task)
                .put(tasks::update_task)
                .patch(tasks::patch_task)
                .delete(tasks::delete_task),
        )
        .route("/tasks/{id}/submit", put(tasks::submit_task))
        .route("/tasks/{id}/cancel", put(tasks::cancel_task))
        .route("/tasks/{id}/attached", get(tasks::attached))
        .route(
            "/tasks/{id}/report",
            get(reports::get_report)
                .post(reports::create_report)
                .put(reports::replace_report)
                .delete(reports::delete_report),
        )
        .route("/tasks/{id}/report/{action}", put(reports::report_action))
        .route(
            "/tasks/{id}/bucket",
            get(buckets::get_task_content)
                .put(buckets::put_task_content)
                .post(buckets::put_task_content)
                .delete(buckets::delete_task_content),
        )
        .route(
            "/tasks/{id}/bucket/{*path}",
            get(buckets::get_task_content)
                .put(buckets::put_task_content)
                .post(buckets::put_task_content)
                .delete(buckets::delete_task_content),
        )
        // 任务组
        .route(
            "/taskgroups",
            get(groups::list_groups).post(groups::create_group),
        )
        .route(
            "/taskgroups/{id}",
            get(groups::get_group)
                .put(groups::update_group)
                .patch(groups::patch_group)
                .delete(groups::delete_group),
        )
        .route("/taskgroups/{id}/submit", put(groups::submit_group))
        .route(
            "/taskgroups/{id}/bucket",
            get(buckets::get_group_content)
                .put(buckets::put_group_content)
                .post(buckets::put_group_content)
                .delete(buckets::delete_group_content),
        )
        .route(
            "/taskgroups/{id}/bucket/{*path}",
            get(buckets::get_group_content)
                .put(buckets::put_group_content)
                .post(buckets::put_group_content)
                .delete(buckets::delete_group_content),
        )
        // 独立 bucket
        .route(
            "/buckets",
            get(buckets::list_buckets).post(buckets::create_bucket),
        )
        .route(
            "/buckets/{id}",
            get(buckets::get_bucket_content).delete(buckets::delete_bucket),
        )
        .route(
            "/buckets/{id}/{*path}",
            get(buckets::get_bucket_content)
                .put(buckets::put_bucket_content)
                .post(buckets::put_bucket_content)
                .delete(buckets::delete_bucket_content),
        )
        // 文件
        .route("/files", get(files::list_files))
        .route(
            "/files/{id}",
            get(files::get_file)
                .post(files::create_file)
                .put(files::append_file)
                .patch(files::append_file)
                .delete(files::delete_file),
        )
        .route_layer(from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}
