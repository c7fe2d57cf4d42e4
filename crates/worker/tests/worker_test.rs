use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use taskhub_api::{create_app, AppState};
use taskhub_core::config::ApiConfig;
use taskhub_core::models::ReportStatus;
use taskhub_testing_utils::{TaskBuilder, TestHarness};
use taskhub_worker::{HubClient, OutputStreamer, TaskReporter};

/// 在随机端口启动 Hub
async fn serve(harness: &TestHarness) -> HubClient {
    let state = AppState {
        db: harness.db.clone(),
        gateway: harness.gateway.clone(),
        tasks: harness.tasks.clone(),
        groups: harness.groups.clone(),
        reports: harness.reports.clone(),
        files: harness.files.clone(),
        buckets: harness.buckets.clone(),
        hub: harness.hub.clone(),
        metrics_endpoint: "/metrics".to_string(),
        prometheus: None,
    };
    let app = create_app(state, &ApiConfig::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    HubClient::new(format!("http://{addr}"), "")
}

async fn reporter(harness: &TestHarness) -> TaskReporter {
    let client = serve(harness).await;
    let task = harness
        .tasks
        .create(
            TaskBuilder::new("worker")
                .with_addon("analyzer")
                .with_data(json!({"path": "/src", "depth": 2}))
                .build(),
            "admin",
        )
        .await
        .unwrap();
    TaskReporter::new(client, task.id)
}

#[derive(Debug, Deserialize)]
struct Data {
    path: String,
    depth: u32,
}

#[tokio::test]
async fn test_task_and_data() {
    let harness = TestHarness::new().await.unwrap();
    let reporter = reporter(&harness).await;

    let task = reporter.task().await.unwrap();
    assert_eq!(task.id, reporter.task_id());
    assert_eq!(task.name, "worker");

    let data: Data = reporter.data().await.unwrap();
    assert_eq!(data.path, "/src");
    assert_eq!(data.depth, 2);

    let missing = reporter.client().get_task(9999).await.unwrap_err();
    assert!(missing.is_not_found());
}

#[tokio::test]
async fn test_report_progress() {
    let harness = TestHarness::new().await.unwrap();
    let reporter = reporter(&harness).await;

    reporter.started().await.unwrap();
    reporter.total(3).await.unwrap();
    reporter.activity("fetching").await.unwrap();
    reporter.increment().await.unwrap();
    reporter.completed(2).await.unwrap();
    reporter.activity("line1\nline2").await.unwrap();
    reporter.error("Warning", "slow").await.unwrap();
    reporter.result(json!({"issues": 4})).await.unwrap();

    let report = reporter.client().get_report(reporter.task_id()).await.unwrap();
    assert_eq!(report.status, ReportStatus::Running);
    assert_eq!(report.total, 3);
    assert_eq!(report.completed, 2);
    assert_eq!(report.activity, vec!["fetching", "line1", "> line2"]);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].severity, "Warning");
    assert_eq!(report.result, json!({"issues": 4}));

    reporter.succeeded().await.unwrap();
    let report = reporter.client().get_report(reporter.task_id()).await.unwrap();
    assert_eq!(report.status, ReportStatus::Succeeded);
    assert_eq!(report.completed, 3);
}

#[tokio::test]
async fn test_run_wraps_outcome() {
    let harness = TestHarness::new().await.unwrap();
    let reporter = reporter(&harness).await;

    reporter
        .run(|r| async move {
            r.total(2).await?;
            r.increment().await?;
            Ok::<(), anyhow::Error>(())
        })
        .await
        .unwrap();
    let report = reporter.client().get_report(reporter.task_id()).await.unwrap();
    assert_eq!(report.status, ReportStatus::Succeeded);
    assert_eq!(report.completed, 2);

    reporter
        .run(|_| async move { Err::<(), _>(anyhow::anyhow!("源码仓库不可达")) })
        .await
        .unwrap();
    let report = reporter.client().get_report(reporter.task_id()).await.unwrap();
    assert_eq!(report.status, ReportStatus::Failed);
    // started 重置了上一轮的报告
    assert_eq!(report.total, 0);
    assert!(report
        .errors
        .iter()
        .any(|e| e.description.contains("源码仓库不可达")));
}

#[tokio::test]
async fn test_files_and_bucket() {
    let harness = TestHarness::new().await.unwrap();
    let reporter = reporter(&harness).await;
    let client = reporter.client();

    let file = client
        .create_file("notes.txt", "text/plain", b"first\n".to_vec())
        .await
        .unwrap();
    client.append_file(file.id, b"second\n".to_vec()).await.unwrap();
    assert_eq!(client.get_file(file.id).await.unwrap(), b"first\nsecond\n");

    reporter.attach_at(&file, 0).await.unwrap();
    let report = client.get_report(reporter.task_id()).await.unwrap();
    assert_eq!(report.attached.len(), 1);
    assert_eq!(report.attached[0].id, file.id);
    assert_eq!(report.attached[0].activity, 0);

    let task = reporter.task_id();
    client
        .put_bucket_file(task, "out/result.json", b"{}".to_vec())
        .await
        .unwrap();
    assert_eq!(client.get_bucket(task, "out/result.json").await.unwrap(), b"{}");
    client.delete_bucket(task, "out/result.json").await.unwrap();
    let err = client.get_bucket(task, "out/result.json").await.unwrap_err();
    assert!(err.is_not_found());
}

#[cfg(unix)]
#[tokio::test]
async fn test_stream_command_output() {
    let harness = TestHarness::new().await.unwrap();
    let reporter = reporter(&harness).await;
    let streamer = OutputStreamer::new(reporter.clone())
        .with_backoff(Duration::from_millis(10), Duration::from_millis(50));

    let mut command = tokio::process::Command::new("sh");
    command.args(["-c", "echo hello; sleep 0.1; echo oops 1>&2"]);
    let (status, file) = streamer.run(&mut command, "build.log").await.unwrap();
    assert!(status.success());

    let content = String::from_utf8(reporter.client().get_file(file.id).await.unwrap()).unwrap();
    assert!(content.contains("hello"));
    assert!(content.contains("oops"));

    let report = reporter.client().get_report(reporter.task_id()).await.unwrap();
    assert!(report.attached.iter().any(|a| a.id == file.id && a.name == "build.log"));
    assert!(report.errors.is_empty());

    let mut command = tokio::process::Command::new("sh");
    command.args(["-c", "exit 3"]);
    let (status, _) = streamer.run(&mut command, "fail.log").await.unwrap();
    assert_eq!(status.code(), Some(3));
    let report = reporter.client().get_report(reporter.task_id()).await.unwrap();
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].description.contains("fail.log"));
}
