//! 端到端场景：服务层 + 任务管理器 + 模拟集群

use serde_json::json;
use taskhub_core::models::{
    event, FailureReason, GroupMode, PodStatus, ReportOp, ReportStatus, Task, TaskState,
};
use taskhub_dispatcher::GroupDeletion;
use taskhub_testing_utils::{
    cluster_config, manager_config, GroupBuilder, TaskBuilder, TestEnv, TestHarness,
};

fn kinds(task: &Task) -> Vec<&str> {
    task.events.iter().map(|e| e.kind.as_str()).collect()
}

#[tokio::test]
async fn test_single_task_happy_path() {
    TestEnv::init_logging();
    let harness = TestHarness::new().await.unwrap();
    let created = harness
        .tasks
        .create(
            TaskBuilder::new("t1")
                .with_kind("analyze")
                .with_addon("analyzer")
                .with_priority(5)
                .build(),
            "admin",
        )
        .await
        .unwrap();
    assert_eq!(created.state, TaskState::Created);
    assert_eq!(created.priority, 15);
    let id = created.id;

    let submitted = harness.tasks.submit(id, None, "admin").await.unwrap();
    assert_eq!(submitted.state, TaskState::Ready);

    harness.ticks(1).await.unwrap();
    assert_eq!(harness.load(id).await.unwrap().state, TaskState::Pending);
    harness.cluster.set_task_status(id, PodStatus::Running).unwrap();
    harness.ticks(1).await.unwrap();
    assert_eq!(harness.load(id).await.unwrap().state, TaskState::Running);

    let reports = &harness.reports;
    reports.apply(id, ReportOp::Started).await.unwrap();
    reports
        .apply(id, ReportOp::Activity { entries: vec!["begin".into()] })
        .await
        .unwrap();
    reports.apply(id, ReportOp::Total { total: 10 }).await.unwrap();
    for _ in 0..10 {
        reports.apply(id, ReportOp::Increment).await.unwrap();
    }
    reports.apply(id, ReportOp::Succeeded).await.unwrap();
    reports
        .apply(id, ReportOp::Result { result: json!({"issues": 0}) })
        .await
        .unwrap();

    harness.cluster.set_task_status(id, PodStatus::Succeeded).unwrap();
    harness.ticks(1).await.unwrap();

    let done = harness.load(id).await.unwrap();
    assert_eq!(done.state, TaskState::Succeeded);
    let events = kinds(&done);
    for expected in [
        event::ADDON_SELECTED,
        event::POD_CREATED,
        event::POD_RUNNING,
        event::POD_SUCCEEDED,
    ] {
        assert!(events.contains(&expected), "missing {expected} in {events:?}");
    }

    let report = reports.get(id).await.unwrap();
    assert_eq!(report.status, ReportStatus::Succeeded);
    assert_eq!(report.total, 10);
    assert_eq!(report.completed, 10);
    assert_eq!(report.activity, vec!["begin".to_string()]);
    assert_eq!(report.result, json!({"issues": 0}));
}

#[tokio::test]
async fn test_preemption() {
    let harness = TestHarness::with_config(cluster_config(1), manager_config(10))
        .await
        .unwrap();
    let a = harness
        .tasks
        .create(
            TaskBuilder::new("a")
                .with_priority(1)
                .preemptible()
                .with_state(TaskState::Ready)
                .build(),
            "admin",
        )
        .await
        .unwrap();
    harness.ticks(1).await.unwrap();
    harness.cluster.set_task_status(a.id, PodStatus::Running).unwrap();
    harness.ticks(1).await.unwrap();
    assert_eq!(harness.load(a.id).await.unwrap().state, TaskState::Running);

    let b = harness
        .tasks
        .create(
            TaskBuilder::new("b")
                .with_priority(9)
                .with_state(TaskState::Ready)
                .build(),
            "admin",
        )
        .await
        .unwrap();
    harness.ticks(1).await.unwrap();

    let victim = harness.load(a.id).await.unwrap();
    assert_eq!(victim.state, TaskState::Ready);
    assert_eq!(victim.retries, 0);
    assert!(victim.pod.is_none());
    assert!(kinds(&victim).contains(&event::PREEMPTED));
    assert_eq!(harness.load(b.id).await.unwrap().state, TaskState::Pending);

    harness.cluster.set_task_status(b.id, PodStatus::Running).unwrap();
    harness.ticks(1).await.unwrap();
    harness.cluster.set_task_status(b.id, PodStatus::Succeeded).unwrap();
    harness.ticks(2).await.unwrap();
    assert_eq!(harness.load(b.id).await.unwrap().state, TaskState::Succeeded);

    assert_eq!(harness.load(a.id).await.unwrap().state, TaskState::Pending);
    harness.cluster.set_task_status(a.id, PodStatus::Running).unwrap();
    harness.ticks(1).await.unwrap();
    let resumed = harness.load(a.id).await.unwrap();
    assert_eq!(resumed.state, TaskState::Running);
    assert_eq!(resumed.retries, 0);
}

#[tokio::test]
async fn test_pipeline_cancels_successors_on_failure() {
    let harness = TestHarness::new().await.unwrap();
    let group = GroupBuilder::new("g")
        .pipeline()
        .with_member("t0")
        .with_member("t1")
        .with_member("t2")
        .build();
    assert_eq!(group.mode, GroupMode::Pipeline);
    let created = harness.groups.create(group, "admin").await.unwrap();
    let ids: Vec<i64> = created.tasks.iter().map(|t| t.id).collect();
    harness.groups.submit(created.id, None, "admin").await.unwrap();

    harness.ticks(1).await.unwrap();
    assert_eq!(harness.load(ids[0]).await.unwrap().state, TaskState::Pending);
    harness
        .cluster
        .set_task_status(
            ids[0],
            PodStatus::Failed {
                reason: FailureReason::Exit(1),
            },
        )
        .unwrap();
    harness.ticks(2).await.unwrap();

    assert_eq!(harness.load(ids[0]).await.unwrap().state, TaskState::Failed);
    for id in &ids[1..] {
        let successor = harness.load(*id).await.unwrap();
        assert_eq!(successor.state, TaskState::Canceled);
        assert!(successor.pod.is_none());
        assert!(!kinds(&successor).contains(&event::POD_CREATED));
    }
    let group = harness.groups.get(created.id).await.unwrap();
    assert!(group.state.is_terminal());

    // 组删除前共享 bucket 保留
    let bucket = harness.groups.bucket(created.id).await.unwrap();
    assert!(std::path::Path::new(&bucket.path).is_dir());
    assert!(matches!(
        harness.groups.delete(created.id).await.unwrap(),
        GroupDeletion::Deleted
    ));
    assert!(!std::path::Path::new(&bucket.path).exists());
}

#[tokio::test]
async fn test_locator_isolation() {
    let harness = TestHarness::new().await.unwrap();
    let mut ids = Vec::new();
    for name in ["x1", "x2"] {
        let task = harness
            .tasks
            .create(
                TaskBuilder::new(name)
                    .with_locator("lock/X")
                    .with_state(TaskState::Ready)
                    .build(),
                "admin",
            )
            .await
            .unwrap();
        ids.push(task.id);
    }

    let mut finished = Vec::new();
    for _ in 0..12 {
        harness.ticks(1).await.unwrap();
        let mut with_pod = Vec::new();
        for id in &ids {
            let task = harness.load(*id).await.unwrap();
            if task.state.has_pod() {
                with_pod.push(task.id);
            } else if !task.is_terminal() {
                assert!(
                    matches!(task.state, TaskState::Ready | TaskState::Postponed),
                    "unexpected {:?}",
                    task.state
                );
            }
        }
        assert!(with_pod.len() <= 1, "both tasks hold pods: {with_pod:?}");
        if let Some(id) = with_pod.first() {
            harness.cluster.set_task_status(*id, PodStatus::Succeeded).unwrap();
            if !finished.contains(id) {
                finished.push(*id);
            }
        }
    }

    assert_eq!(finished.len(), 2);
    for id in &ids {
        assert_eq!(harness.load(*id).await.unwrap().state, TaskState::Succeeded);
    }
    let second = harness.load(finished[1]).await.unwrap();
    assert!(kinds(&second).contains(&event::POSTPONED));
}

#[tokio::test]
async fn test_image_pull_failure_is_fatal() {
    let harness = TestHarness::new().await.unwrap();
    let task = harness
        .tasks
        .create(
            TaskBuilder::new("img").with_state(TaskState::Ready).build(),
            "admin",
        )
        .await
        .unwrap();
    harness.ticks(1).await.unwrap();
    assert_eq!(harness.load(task.id).await.unwrap().state, TaskState::Pending);

    harness
        .cluster
        .set_task_status(
            task.id,
            PodStatus::Failed {
                reason: FailureReason::ImagePull("ErrImagePull".into()),
            },
        )
        .unwrap();
    harness.ticks(2).await.unwrap();

    let failed = harness.load(task.id).await.unwrap();
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.retries, 0);
    assert!(failed.pod.is_none());
    assert!(kinds(&failed).contains(&event::IMAGE_ERROR));
    assert!(failed.errors[0].description.starts_with("ImagePull"));
    assert!(harness.cluster.pod_specs().unwrap().is_empty());
}

#[tokio::test]
async fn test_started_resets_report() {
    let harness = TestHarness::new().await.unwrap();
    let task = harness
        .tasks
        .create(TaskBuilder::new("rpt").build(), "admin")
        .await
        .unwrap();
    let reports = &harness.reports;

    reports.apply(task.id, ReportOp::Started).await.unwrap();
    reports
        .apply(
            task.id,
            ReportOp::Activity {
                entries: vec!["a".into(), "b".into()],
            },
        )
        .await
        .unwrap();
    reports
        .apply(task.id, ReportOp::Completed { completed: 2 })
        .await
        .unwrap();
    reports
        .apply(
            task.id,
            ReportOp::Error {
                severity: "Warning".into(),
                description: "slow".into(),
            },
        )
        .await
        .unwrap();
    let before = reports.get(task.id).await.unwrap();
    assert_eq!(before.activity, vec!["a", "b"]);
    assert_eq!(before.completed, 2);

    reports.apply(task.id, ReportOp::Started).await.unwrap();
    let after = reports.get(task.id).await.unwrap();
    assert_eq!(after.generation, before.generation + 1);
    assert_eq!(after.status, ReportStatus::Running);
    assert!(after.activity.is_empty());
    assert_eq!(after.completed, 0);
    assert!(after.errors.is_empty());
    assert!(after.attached.is_empty());
    assert_eq!(after.result, json!({}));
}
