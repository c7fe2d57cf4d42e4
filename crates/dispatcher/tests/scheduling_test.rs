use taskhub_core::models::{event, PodStatus, Task, TaskState};
use taskhub_testing_utils::{cluster_config, manager_config, TaskBuilder, TestHarness};

fn kinds(task: &Task) -> Vec<&str> {
    task.events.iter().map(|e| e.kind.as_str()).collect()
}

#[tokio::test]
async fn test_dependency_runs_first_and_is_escalated() {
    let harness = TestHarness::new().await.unwrap();
    let analyze = harness
        .insert(
            TaskBuilder::new("analyze")
                .with_kind("analyze")
                .with_priority(10)
                .with_application(1)
                .with_state(TaskState::Ready)
                .build(),
        )
        .await
        .unwrap();
    let discovery = harness
        .insert(
            TaskBuilder::new("discovery")
                .with_kind("analyze-discovery")
                .with_priority(5)
                .with_application(1)
                .with_state(TaskState::Ready)
                .build(),
        )
        .await
        .unwrap();

    harness.ticks(1).await.unwrap();
    let postponed = harness.load(analyze.id).await.unwrap();
    let running = harness.load(discovery.id).await.unwrap();
    assert_eq!(postponed.state, TaskState::Postponed);
    assert_eq!(running.state, TaskState::Pending);
    assert_eq!(running.priority, 10);
    assert!(kinds(&running).contains(&event::ESCALATED));

    harness
        .cluster
        .set_task_status(discovery.id, PodStatus::Running)
        .unwrap();
    harness.ticks(1).await.unwrap();
    harness
        .cluster
        .set_task_status(discovery.id, PodStatus::Succeeded)
        .unwrap();
    harness.ticks(2).await.unwrap();

    assert_eq!(
        harness.load(discovery.id).await.unwrap().state,
        TaskState::Succeeded
    );
    let released = harness.load(analyze.id).await.unwrap();
    assert_eq!(released.state, TaskState::Pending);
    assert!(kinds(&released).contains(&event::RELEASED));
}

#[tokio::test]
async fn test_same_locator_never_runs_concurrently() {
    let harness = TestHarness::new().await.unwrap();
    let mut ids = Vec::new();
    for name in ["first", "second"] {
        let task = harness
            .insert(
                TaskBuilder::new(name)
                    .with_kind("analyze-discovery")
                    .with_locator("analyze/app/42")
                    .with_priority(20)
                    .with_state(TaskState::Ready)
                    .build(),
            )
            .await
            .unwrap();
        ids.push(task.id);
    }

    harness.ticks(2).await.unwrap();
    let first = harness.load(ids[0]).await.unwrap();
    let second = harness.load(ids[1]).await.unwrap();
    assert_eq!(first.state, TaskState::Pending);
    assert_eq!(second.state, TaskState::Postponed);
    let reason = &second.events.last().unwrap().reason;
    assert!(reason.starts_with("Rule:Locator"), "{reason}");
}

#[tokio::test]
async fn test_capacity_blocks_until_node_frees() {
    let harness = TestHarness::with_config(cluster_config(1), manager_config(10))
        .await
        .unwrap();
    let a = harness
        .insert(
            TaskBuilder::new("a")
                .with_kind("analyze-discovery")
                .with_priority(20)
                .with_state(TaskState::Ready)
                .build(),
        )
        .await
        .unwrap();
    let b = harness
        .insert(
            TaskBuilder::new("b")
                .with_kind("analyze-discovery")
                .with_priority(20)
                .with_state(TaskState::Ready)
                .build(),
        )
        .await
        .unwrap();

    harness.ticks(1).await.unwrap();
    assert_eq!(harness.load(a.id).await.unwrap().state, TaskState::Pending);
    let blocked = harness.load(b.id).await.unwrap();
    assert_eq!(blocked.state, TaskState::QuotaBlocked);
    assert!(kinds(&blocked).contains(&event::QUOTA_BLOCKED));

    harness.cluster.set_task_status(a.id, PodStatus::Running).unwrap();
    harness.ticks(1).await.unwrap();
    harness.cluster.set_task_status(a.id, PodStatus::Succeeded).unwrap();
    harness.ticks(2).await.unwrap();

    assert_eq!(harness.load(a.id).await.unwrap().state, TaskState::Succeeded);
    assert_eq!(harness.load(b.id).await.unwrap().state, TaskState::Pending);
}
