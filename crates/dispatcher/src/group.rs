//! 任务组服务
//!
//! 组的 kind/addon/extensions/data 在创建与提交时作为默认值合并到成员中。
//! Batch 模式提交时全部成员进入 Ready；Pipeline 模式只释放第一个成员，
//! 后续成员由任务管理器在前驱成功后逐个释放。

use chrono::Utc;
use serde_json::Value;
use taskhub_core::models::{
    data, event, Bucket, GroupMode, ListQuery, Page, Task, TaskGroup, TaskState,
};
use taskhub_core::{HubError, HubResult};
use taskhub_infrastructure::{BucketStore, StructuredLogger};
use tracing::{debug, info, instrument, warn};

use crate::gateway::PersistenceGateway;
use crate::service::{expire_attachments, TaskService};

/// 删除请求的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDeletion {
    /// 已立即删除
    Deleted,
    /// 成员仍在运行，等待任务管理器完成删除
    Accepted,
}

#[derive(Clone)]
pub struct GroupService {
    gateway: PersistenceGateway,
    tasks: TaskService,
    buckets: BucketStore,
}

impl GroupService {
    pub fn new(gateway: PersistenceGateway, tasks: TaskService, buckets: BucketStore) -> Self {
        Self {
            gateway,
            tasks,
            buckets,
        }
    }

    #[instrument(skip(self, group), fields(group.name = %group.name))]
    pub async fn create(&self, mut group: TaskGroup, user: &str) -> HubResult<TaskGroup> {
        TaskGroup::validate_state(group.state)?;
        let submit = group.state == TaskState::Ready;
        group.id = 0;
        group.delete_requested = false;
        group.create_user = user.to_string();
        group.create_time = Utc::now();
        if group.priority != 0 {
            group.priority = Task::user_priority(group.priority);
        }
        for member in group.tasks.iter_mut() {
            new_member(member, user);
        }

        let bucket = self.gateway.buckets.create(self.buckets.root(), user).await?;
        self.buckets.ensure(&bucket).await?;
        group.bucket_id = Some(bucket.id);

        let created = async {
            self.prepare_members(&mut group, submit).await?;
            self.gateway.groups.create(&group).await
        }
        .await;
        match created {
            Ok(created) => {
                info!(
                    "创建任务组 {} ({}), 成员 {} 个",
                    created.id,
                    created.mode,
                    created.tasks.len()
                );
                Ok(created)
            }
            Err(e) => {
                if let Err(cleanup) = remove_bucket(&self.gateway, &self.buckets, bucket.id).await {
                    warn!("回滚 bucket {} 失败: {}", bucket.id, cleanup);
                }
                Err(e)
            }
        }
    }

    pub async fn get(&self, id: i64) -> HubResult<TaskGroup> {
        self.gateway
            .groups
            .get(id)
            .await?
            .ok_or_else(|| HubError::not_found("TaskGroup", id))
    }

    pub async fn list(&self, query: &ListQuery) -> HubResult<Page<TaskGroup>> {
        self.gateway.groups.list(query).await
    }

    /// 只有 Created 状态的任务组可以修改，其余状态下返回未修改的任务组
    #[instrument(skip(self, incoming))]
    pub async fn update(&self, id: i64, incoming: TaskGroup, user: &str) -> HubResult<TaskGroup> {
        TaskGroup::validate_state(incoming.state)?;
        let mut group = self.get(id).await?;
        if group.state != TaskState::Created {
            debug!("任务组 {} 处于 {}，忽略更新", id, group.state);
            return Ok(group);
        }
        group.name = incoming.name;
        group.kind = incoming.kind;
        group.addon = incoming.addon;
        group.extensions = incoming.extensions;
        group.priority = match incoming.priority {
            0 => 0,
            p => Task::user_priority(p),
        };
        group.policy = incoming.policy;
        group.mode = incoming.mode;
        group.data = incoming.data;

        let mut existing = std::mem::take(&mut group.tasks);
        for mut member in incoming.tasks {
            match existing.iter().position(|t| t.id == member.id && member.id != 0) {
                Some(index) => {
                    let mut kept = existing.swap_remove(index);
                    overwrite_member(&mut kept, member);
                    group.tasks.push(kept);
                }
                None => {
                    new_member(&mut member, user);
                    group.tasks.push(member);
                }
            }
        }

        let submit = incoming.state == TaskState::Ready;
        self.prepare_members(&mut group, submit).await?;
        self.gateway.groups.update(&group).await
    }

    pub async fn patch(&self, id: i64, patch: &Value, user: &str) -> HubResult<TaskGroup> {
        let current = self.get(id).await?;
        let incoming = merge_patch(&current, patch)?;
        self.update(id, incoming, user).await
    }

    /// 可选地先打补丁，然后提交任务组
    #[instrument(skip(self, patch))]
    pub async fn submit(&self, id: i64, patch: Option<&Value>, user: &str) -> HubResult<TaskGroup> {
        let current = self.get(id).await?;
        let mut incoming = match patch {
            Some(patch) => merge_patch(&current, patch)?,
            None => current,
        };
        incoming.state = TaskState::Ready;
        self.update(id, incoming, user).await
    }

    /// 删除任务组
    ///
    /// 所有成员都已终止时立即删除成员、任务组和共享 bucket；
    /// 否则标记成员取消并等待任务管理器完成删除。
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> HubResult<GroupDeletion> {
        let group = self.get(id).await?;
        if group.tasks.iter().all(|t| t.is_terminal() && t.pod.is_none()) {
            purge_group(&self.gateway, &self.buckets, &group).await?;
            return Ok(GroupDeletion::Deleted);
        }
        for member in group.tasks.iter().filter(|t| !t.is_terminal()) {
            if member.cancel_requested {
                continue;
            }
            let mut member = member.clone();
            member.cancel_requested = true;
            match self.gateway.tasks.update(&member).await {
                Ok(_) => {}
                // 任务管理器在完成删除前会再次标记
                Err(HubError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.gateway.groups.request_delete(id).await?;
        info!("任务组 {} 等待成员终止后删除", id);
        Ok(GroupDeletion::Accepted)
    }

    pub async fn bucket(&self, id: i64) -> HubResult<Bucket> {
        let group = self.get(id).await?;
        let bucket_id = group
            .bucket_id
            .ok_or_else(|| HubError::not_found("Bucket", format!("taskgroup/{id}")))?;
        let bucket = self
            .gateway
            .buckets
            .get(bucket_id)
            .await?
            .ok_or_else(|| HubError::not_found("Bucket", bucket_id))?;
        self.buckets.ensure(&bucket).await?;
        Ok(bucket)
    }

    /// 合并组默认值、校验集群引用；提交时按模式释放成员
    async fn prepare_members(&self, group: &mut TaskGroup, submit: bool) -> HubResult<()> {
        let defaults = TaskGroup {
            tasks: Vec::new(),
            ..group.clone()
        };
        let mode = group.mode;
        for (index, member) in group.tasks.iter_mut().enumerate() {
            defaults.propagate(member);
            self.tasks.prepare(member).await?;
            let release = mode == GroupMode::Batch || index == 0;
            if submit && release && member.state == TaskState::Created {
                member.transition(TaskState::Ready, event::SUBMITTED, "")?;
            }
        }
        if submit {
            group.state = TaskState::Ready;
        }
        Ok(())
    }
}

/// 删除任务组、成员以及共享 bucket（最后删除）
pub async fn purge_group(
    gateway: &PersistenceGateway,
    buckets: &BucketStore,
    group: &TaskGroup,
) -> HubResult<()> {
    for member in &group.tasks {
        let report = gateway.reports.get(member.id).await?;
        expire_attachments(gateway, member, report.as_ref()).await?;
    }
    gateway.groups.delete(group.id).await?;
    if let Some(bucket_id) = group.bucket_id {
        remove_bucket(gateway, buckets, bucket_id).await?;
    }
    debug!("任务组 {} 已删除", group.id);
    Ok(())
}

async fn remove_bucket(
    gateway: &PersistenceGateway,
    buckets: &BucketStore,
    bucket_id: i64,
) -> HubResult<()> {
    if let Some(bucket) = gateway.buckets.get(bucket_id).await? {
        buckets.delete(&bucket, "").await?;
        gateway.buckets.delete(bucket_id).await?;
        StructuredLogger::log_bucket_op(bucket_id, "delete", &bucket.path);
    }
    Ok(())
}

fn new_member(member: &mut Task, user: &str) {
    member.id = 0;
    member.version = 0;
    member.state = TaskState::Created;
    member.pod = None;
    member.retries = 0;
    member.started = None;
    member.terminated = None;
    member.cancel_requested = false;
    member.events.clear();
    member.errors.clear();
    member.attached.clear();
    member.token = None;
    member.report = None;
    member.create_time = Utc::now();
    if member.create_user.is_empty() {
        member.create_user = user.to_string();
    }
    if member.priority != 0 {
        member.priority = Task::user_priority(member.priority);
    }
}

fn overwrite_member(kept: &mut Task, incoming: Task) {
    kept.name = incoming.name;
    kept.kind = incoming.kind;
    kept.addon = incoming.addon;
    kept.extensions = incoming.extensions;
    kept.locator = incoming.locator;
    kept.priority = match incoming.priority {
        0 => 0,
        p => Task::user_priority(p),
    };
    kept.policy = incoming.policy;
    kept.ttl = incoming.ttl;
    kept.application = incoming.application;
    kept.platform = incoming.platform;
    kept.data = incoming.data;
}

fn merge_patch(current: &TaskGroup, patch: &Value) -> HubResult<TaskGroup> {
    if !patch.is_object() {
        return Err(HubError::bad_request("补丁必须是 JSON 对象"));
    }
    let document = data::merge(&serde_json::to_value(current)?, patch);
    serde_json::from_value(document).map_err(|e| HubError::bad_request(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{manager_config, Fixture};
    use serde_json::json;
    use std::path::Path;
    use taskhub_core::models::{FailureReason, PodStatus};

    fn group(mode: GroupMode, members: &[&str]) -> TaskGroup {
        TaskGroup {
            name: "g1".into(),
            kind: "analyze".into(),
            addon: "analyzer".into(),
            mode,
            data: json!({"mode": {"binary": false}, "tagger": {"enabled": true}}),
            tasks: members
                .iter()
                .map(|name| {
                    let mut task = Task::new(*name);
                    task.data = json!({"mode": {"binary": true}});
                    task
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_batch_ready() {
        let fx = Fixture::new(10).await;
        let mut batch = group(GroupMode::Batch, &["a", "b"]);
        batch.state = TaskState::Ready;
        let created = fx.groups().create(batch, "admin").await.unwrap();

        assert_eq!(created.state, TaskState::Ready);
        let bucket_id = created.bucket_id.unwrap();
        for member in &created.tasks {
            assert_eq!(member.state, TaskState::Ready);
            assert_eq!(member.bucket_id, Some(bucket_id));
            assert_eq!(member.task_group_id, Some(created.id));
            assert_eq!(member.kind, "analyze");
            assert_eq!(member.priority, 10);
            assert_eq!(member.data["mode"]["binary"], true);
            assert_eq!(member.data["tagger"]["enabled"], true);
        }
    }

    #[tokio::test]
    async fn test_create_rejects_queued_state() {
        let fx = Fixture::new(10).await;
        let mut bad = group(GroupMode::Batch, &["a"]);
        bad.state = TaskState::Running;
        assert!(fx.groups().create(bad, "").await.unwrap_err().is_validation());

        let mut unknown = group(GroupMode::Batch, &["a"]);
        unknown.addon = "missing".into();
        assert!(fx.groups().create(unknown, "").await.is_err());
        assert!(fx.gateway.buckets.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_submit_releases_first() {
        let fx = Fixture::new(10).await;
        let service = fx.groups();
        let created = service
            .create(group(GroupMode::Pipeline, &["a", "b", "c"]), "")
            .await
            .unwrap();
        assert!(created.tasks.iter().all(|t| t.state == TaskState::Created));

        let submitted = service.submit(created.id, None, "").await.unwrap();
        assert_eq!(submitted.state, TaskState::Ready);
        let states: Vec<TaskState> = submitted.tasks.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![TaskState::Ready, TaskState::Created, TaskState::Created]
        );
    }

    #[tokio::test]
    async fn test_pipeline_runs_in_order() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let mut pipeline = group(GroupMode::Pipeline, &["a", "b"]);
        pipeline.state = TaskState::Ready;
        let created = fx.groups().create(pipeline, "").await.unwrap();
        let (a, b) = (created.tasks[0].id, created.tasks[1].id);

        manager.tick().await.unwrap();
        assert_eq!(fx.load(a).await.state, TaskState::Pending);
        assert_eq!(fx.load(b).await.state, TaskState::Created);

        fx.cluster.set_task_status(a, PodStatus::Running).unwrap();
        manager.tick().await.unwrap();
        fx.cluster
            .set_task_status(
                a,
                PodStatus::Failed {
                    reason: FailureReason::Exit(1),
                },
            )
            .unwrap();
        manager.tick().await.unwrap();
        manager.tick().await.unwrap();

        assert_eq!(fx.load(a).await.state, TaskState::Failed);
        let successor = fx.load(b).await;
        assert_eq!(successor.state, TaskState::Canceled);
        assert!(successor.started.is_some());
        assert_eq!(fx.groups().get(created.id).await.unwrap().state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_pipeline_member_cannot_be_submitted_directly() {
        let fx = Fixture::new(10).await;
        let mut pipeline = group(GroupMode::Pipeline, &["a", "b"]);
        pipeline.state = TaskState::Ready;
        let created = fx.groups().create(pipeline, "").await.unwrap();
        let b = created.tasks[1].id;

        let err = fx.tasks().submit(b, None, "admin").await.unwrap_err();
        assert!(matches!(err, HubError::BadRequest(_)), "{err:?}");
        assert_eq!(fx.load(b).await.state, TaskState::Created);
    }

    #[tokio::test]
    async fn test_queued_successor_canceled_when_predecessor_fails() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let mut pipeline = group(GroupMode::Pipeline, &["a", "b"]);
        pipeline.state = TaskState::Ready;
        let created = fx.groups().create(pipeline, "").await.unwrap();
        let (a, b) = (created.tasks[0].id, created.tasks[1].id);
        let mut successor = fx.load(b).await;
        successor.state = TaskState::Ready;
        fx.gateway.tasks.update(&successor).await.unwrap();

        manager.tick().await.unwrap();
        assert_eq!(fx.load(a).await.state, TaskState::Pending);
        let held = fx.load(b).await;
        assert_eq!(held.state, TaskState::Postponed);
        assert!(held.pod.is_none());

        fx.cluster.set_task_status(a, PodStatus::Running).unwrap();
        manager.tick().await.unwrap();
        fx.cluster
            .set_task_status(
                a,
                PodStatus::Failed {
                    reason: FailureReason::Exit(1),
                },
            )
            .unwrap();
        manager.tick().await.unwrap();
        manager.tick().await.unwrap();

        assert_eq!(fx.load(a).await.state, TaskState::Failed);
        let canceled = fx.load(b).await;
        assert_eq!(canceled.state, TaskState::Canceled);
        assert!(canceled.pod.is_none());
        assert!(canceled.bucket_id.is_none());
    }

    #[tokio::test]
    async fn test_update_only_when_created() {
        let fx = Fixture::new(10).await;
        let service = fx.groups();
        let created = service
            .create(group(GroupMode::Batch, &["a"]), "")
            .await
            .unwrap();

        let mut incoming = created.clone();
        incoming.name = "renamed".into();
        let mut extra = Task::new("b");
        extra.priority = 2;
        incoming.tasks.push(extra);
        let updated = service.update(created.id, incoming, "").await.unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.tasks.len(), 2);
        assert_eq!(updated.tasks[0].id, created.tasks[0].id);
        assert_eq!(updated.tasks[1].priority, 12);

        service.submit(created.id, None, "").await.unwrap();
        let mut late = updated.clone();
        late.name = "late".into();
        let unchanged = service.update(created.id, late, "").await.unwrap();
        assert_eq!(unchanged.name, "renamed");
    }

    #[tokio::test]
    async fn test_delete_terminal_group() {
        let fx = Fixture::new(10).await;
        let service = fx.groups();
        let created = service
            .create(group(GroupMode::Batch, &["a"]), "")
            .await
            .unwrap();
        let bucket = service.bucket(created.id).await.unwrap();
        for member in &created.tasks {
            let mut member = fx.load(member.id).await;
            member.state = TaskState::Canceled;
            fx.gateway.tasks.update(&member).await.unwrap();
        }

        assert_eq!(service.delete(created.id).await.unwrap(), GroupDeletion::Deleted);
        assert!(service.get(created.id).await.unwrap_err().is_not_found());
        assert!(fx.gateway.tasks.get(created.tasks[0].id).await.unwrap().is_none());
        assert!(!Path::new(&bucket.path).exists());
    }

    #[tokio::test]
    async fn test_delete_deferred_until_members_terminal() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let service = fx.groups();
        let mut batch = group(GroupMode::Batch, &["a", "b"]);
        batch.state = TaskState::Ready;
        let created = service.create(batch, "").await.unwrap();
        manager.tick().await.unwrap();

        assert_eq!(service.delete(created.id).await.unwrap(), GroupDeletion::Accepted);
        assert!(service.get(created.id).await.unwrap().delete_requested);

        manager.tick().await.unwrap();
        manager.tick().await.unwrap();
        assert!(service.get(created.id).await.unwrap_err().is_not_found());
        assert!(fx.cluster.pod_specs().unwrap().is_empty());
        assert!(fx.gateway.buckets.list().await.unwrap().is_empty());
    }
}
