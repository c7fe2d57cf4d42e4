//! 任务服务：REST 层之下的任务创建、更新、提交、取消与删除
//!
//! 状态推进由任务管理器完成，这里只负责校验用户输入、补全 kind 默认值，
//! 以及维护任务独占的 bucket。

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use taskhub_core::models::{
    data, event, Attachment, Bucket, GroupMode, ListQuery, Page, QueueReport, Ref, ReportStatus,
    Task, TaskReport, TaskState,
};
use taskhub_core::traits::ClusterDriver;
use taskhub_core::{HubError, HubResult};
use taskhub_infrastructure::{BucketStore, FileStore, MetricsCollector, StructuredLogger};
use tracing::{debug, instrument, warn};

use crate::gateway::PersistenceGateway;

/// 仪表盘中的一行：任务与其报告、应用、平台的扁平视图
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDashboard {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub addon: String,
    pub state: TaskState,
    pub locator: String,
    pub create_user: String,
    pub application: Option<Ref>,
    pub platform: Option<Ref>,
    pub started: Option<DateTime<Utc>>,
    pub terminated: Option<DateTime<Utc>>,
    pub errors: usize,
    pub status: Option<ReportStatus>,
    pub total: i64,
    pub completed: i64,
}

#[derive(Clone)]
pub struct TaskService {
    gateway: PersistenceGateway,
    cluster: Arc<dyn ClusterDriver>,
    files: FileStore,
    buckets: BucketStore,
    metrics: Arc<MetricsCollector>,
}

impl TaskService {
    pub fn new(
        gateway: PersistenceGateway,
        cluster: Arc<dyn ClusterDriver>,
        files: FileStore,
        buckets: BucketStore,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            gateway,
            cluster,
            files,
            buckets,
            metrics,
        }
    }

    pub fn gateway(&self) -> &PersistenceGateway {
        &self.gateway
    }

    /// 创建任务
    ///
    /// 只接受 Created 或 Ready；addon、extension、kind 必须在集群注册表中存在。
    #[instrument(skip(self, task), fields(task.name = %task.name))]
    pub async fn create(&self, mut task: Task, user: &str) -> HubResult<Task> {
        if !matches!(task.state, TaskState::Created | TaskState::Ready) {
            return Err(HubError::bad_request(format!(
                "新任务的状态必须为 Created 或 Ready: {}",
                task.state
            )));
        }
        reset_execution(&mut task);
        task.task_group_id = None;
        task.create_user = user.to_string();
        task.update_user = user.to_string();
        task.create_time = Utc::now();
        if task.priority != 0 {
            task.priority = Task::user_priority(task.priority);
        }
        self.prepare(&mut task).await?;

        let bucket = self.gateway.buckets.create(self.buckets.root(), user).await?;
        self.buckets.ensure(&bucket).await?;
        task.bucket_id = Some(bucket.id);

        let created = match self.gateway.tasks.create(&task).await {
            Ok(created) => created,
            Err(e) => {
                self.drop_bucket(bucket.id).await;
                return Err(e);
            }
        };
        StructuredLogger::log_task_created(created.id, &created.name, &created.kind, created.state);
        self.metrics.record_task_created();
        Ok(created)
    }

    /// 校验集群引用并补全 kind 的默认优先级与数据
    pub(crate) async fn prepare(&self, task: &mut Task) -> HubResult<()> {
        if task.kind.is_empty() && task.addon.is_empty() {
            return Err(HubError::bad_request("kind 与 addon 至少指定一个"));
        }
        if !task.addon.is_empty() {
            let addon = self.cluster.lookup_addon(&task.addon).await?;
            for name in &task.extensions {
                let extension = self.cluster.lookup_extension(name).await?;
                if !extension.applies_to(&addon.name) {
                    return Err(HubError::bad_request(format!(
                        "Extension: '{}' not supported by addon: '{}'.",
                        name, addon.name
                    )));
                }
            }
        } else {
            for name in &task.extensions {
                self.cluster.lookup_extension(name).await?;
            }
        }
        if !task.kind.is_empty() {
            let kind = self.cluster.lookup_kind(&task.kind).await?;
            if task.priority == 0 {
                task.priority = kind.priority;
            }
            task.data = data::merge(&kind.data, &task.data);
        }
        Ok(())
    }

    pub async fn get(&self, id: i64) -> HubResult<Task> {
        let mut task = self.load(id).await?;
        task.report = self.gateway.reports.get(id).await?;
        Ok(task)
    }

    /// 返回报告 activity 中内联了附件内容的任务
    pub async fn get_merged(&self, id: i64) -> HubResult<Task> {
        let mut task = self.get(id).await?;
        if let Some(report) = task.report.as_mut() {
            let mut contents: Vec<(Attachment, String)> = Vec::new();
            for attachment in &report.attached {
                let Some(file) = self.gateway.files.get(attachment.id).await? else {
                    continue;
                };
                match self.files.read_to_string(&file).await {
                    Ok(content) => contents.push((attachment.clone(), content)),
                    Err(e) => warn!("读取附件 {} 失败: {}", file.id, e),
                }
            }
            report.activity = report.merge_attached(&contents);
        }
        Ok(task)
    }

    pub async fn list(&self, query: &ListQuery) -> HubResult<Page<Task>> {
        self.gateway.tasks.list(query).await
    }

    /// 更新任务
    ///
    /// Created 任务可修改全部用户字段；排队中的任务只能修改 name、locator、policy、ttl；
    /// 其余状态下请求被忽略，返回未修改的任务。
    #[instrument(skip(self, incoming))]
    pub async fn update(&self, id: i64, incoming: Task, user: &str) -> HubResult<Task> {
        let mut task = self.load(id).await?;
        match task.state {
            TaskState::Created => {
                task.name = incoming.name;
                task.kind = incoming.kind;
                task.addon = incoming.addon;
                task.extensions = incoming.extensions;
                task.locator = incoming.locator;
                task.priority = match incoming.priority {
                    0 => 0,
                    p => Task::user_priority(p),
                };
                task.policy = incoming.policy;
                task.ttl = incoming.ttl;
                task.application = incoming.application;
                task.platform = incoming.platform;
                task.data = incoming.data;
                self.prepare(&mut task).await?;
                if incoming.state == TaskState::Ready {
                    self.ensure_not_pipelined(&task).await?;
                    task.transition(TaskState::Ready, event::SUBMITTED, "")?;
                }
            }
            TaskState::Ready
            | TaskState::Postponed
            | TaskState::QuotaBlocked
            | TaskState::Pending => {
                task.name = incoming.name;
                task.locator = incoming.locator;
                task.policy = incoming.policy;
                task.ttl = incoming.ttl;
            }
            state => {
                debug!("任务 {} 处于 {}，忽略更新", id, state);
                return Ok(task);
            }
        }
        task.update_user = user.to_string();
        self.gateway.tasks.update(&task).await
    }

    /// 流水线成员只能由任务组释放
    async fn ensure_not_pipelined(&self, task: &Task) -> HubResult<()> {
        let Some(group_id) = task.task_group_id else {
            return Ok(());
        };
        let group = self.gateway.groups.get(group_id).await?;
        if group.is_some_and(|g| g.mode == GroupMode::Pipeline) {
            return Err(HubError::bad_request(format!(
                "任务 {} 属于流水线任务组 {}，只能随任务组提交",
                task.id, group_id
            )));
        }
        Ok(())
    }

    /// JSON merge 方式的部分更新
    pub async fn patch(&self, id: i64, patch: &Value, user: &str) -> HubResult<Task> {
        let current = self.load(id).await?;
        let incoming = merge_patch(&current, patch)?;
        self.update(id, incoming, user).await
    }

    /// 可选地先打补丁，然后将 Created 任务提交为 Ready
    #[instrument(skip(self, patch))]
    pub async fn submit(&self, id: i64, patch: Option<&Value>, user: &str) -> HubResult<Task> {
        let current = self.load(id).await?;
        let mut incoming = match patch {
            Some(patch) => merge_patch(&current, patch)?,
            None => current,
        };
        incoming.state = TaskState::Ready;
        self.update(id, incoming, user).await
    }

    /// 请求取消；终态任务上为空操作。实际迁移由任务管理器在下一周期完成
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: i64) -> HubResult<()> {
        let mut task = self.load(id).await?;
        if task.is_terminal() || task.cancel_requested {
            return Ok(());
        }
        task.cancel_requested = true;
        self.gateway.tasks.update(&task).await?;
        debug!("任务 {} 已请求取消", id);
        Ok(())
    }

    /// 按过滤条件批量取消，返回受影响的任务数
    pub async fn cancel_list(&self, query: &ListQuery) -> HubResult<usize> {
        let query = ListQuery {
            limit: None,
            offset: 0,
            ..query.clone()
        };
        let mut canceled = 0;
        for task in self.gateway.tasks.list(&query).await?.items {
            if task.is_terminal() || task.cancel_requested {
                continue;
            }
            match self.cancel(task.id).await {
                Ok(()) => canceled += 1,
                Err(HubError::Conflict(_)) => {
                    // 管理器同时保存了任务，重新读取一次
                    self.cancel(task.id).await?;
                    canceled += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(canceled)
    }

    /// 删除任务：移除 Pod、报告、独占 bucket，附件交给文件回收器
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> HubResult<()> {
        let task = self.load(id).await?;
        if let Some(pod) = &task.pod {
            match self.cluster.delete_pod(pod).await {
                Ok(_) => StructuredLogger::log_pod_deleted(Some(id), pod, "task deleted"),
                Err(e) => warn!("删除任务 {} 的Pod失败，留给孤儿清理: {}", id, e),
            }
        }
        let report = self.gateway.reports.get(id).await?;
        expire_attachments(&self.gateway, &task, report.as_ref()).await?;
        self.gateway.tasks.delete(id).await?;
        if task.task_group_id.is_none() {
            if let Some(bucket_id) = task.bucket_id {
                self.drop_bucket(bucket_id).await;
            }
        }
        debug!("任务 {} 已删除", id);
        Ok(())
    }

    pub async fn queue(&self, addon: Option<&str>) -> HubResult<QueueReport> {
        self.gateway.tasks.queue_counts(addon).await
    }

    pub async fn dashboard(&self, query: &ListQuery) -> HubResult<Page<TaskDashboard>> {
        let page = self.gateway.tasks.list(query).await?;
        let mut items = Vec::with_capacity(page.items.len());
        for task in page.items {
            let report = self.gateway.reports.get(task.id).await?;
            items.push(dashboard_row(task, report));
        }
        Ok(Page {
            items,
            total: page.total,
        })
    }

    /// 任务与报告附件打成的 TAR
    pub async fn attached_tar(&self, id: i64) -> HubResult<Vec<u8>> {
        let task = self.get(id).await?;
        let mut seen = BTreeSet::new();
        let mut records = Vec::new();
        let report_attached = task.report.iter().flat_map(|r| r.attached.iter());
        for attachment in task.attached.iter().chain(report_attached) {
            if !seen.insert(attachment.id) {
                continue;
            }
            if let Some(file) = self.gateway.files.get(attachment.id).await? {
                records.push(file);
            }
        }
        self.files.tar(records).await
    }

    /// 任务当前引用的 bucket
    pub async fn bucket(&self, id: i64) -> HubResult<Bucket> {
        let task = self.load(id).await?;
        let bucket_id = task
            .bucket_id
            .ok_or_else(|| HubError::not_found("Bucket", format!("task/{id}")))?;
        let bucket = self
            .gateway
            .buckets
            .get(bucket_id)
            .await?
            .ok_or_else(|| HubError::not_found("Bucket", bucket_id))?;
        self.buckets.ensure(&bucket).await?;
        Ok(bucket)
    }

    async fn load(&self, id: i64) -> HubResult<Task> {
        self.gateway
            .tasks
            .get(id)
            .await?
            .ok_or_else(|| HubError::not_found("Task", id))
    }

    async fn drop_bucket(&self, bucket_id: i64) {
        let result = async {
            if let Some(bucket) = self.gateway.buckets.get(bucket_id).await? {
                self.buckets.delete(&bucket, "").await?;
                self.gateway.buckets.delete(bucket_id).await?;
                StructuredLogger::log_bucket_op(bucket_id, "delete", &bucket.path);
            }
            HubResult::Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!("删除 bucket {} 失败，留给回收器: {}", bucket_id, e);
        }
    }
}

/// 客户端不能设置的执行字段
fn reset_execution(task: &mut Task) {
    task.id = 0;
    task.version = 0;
    task.pod = None;
    task.node = None;
    task.retries = 0;
    task.started = None;
    task.terminated = None;
    task.cancel_requested = false;
    task.reaped = false;
    task.bucket_id = None;
    task.events.clear();
    task.errors.clear();
    task.attached.clear();
    task.token = None;
    task.report = None;
}

fn merge_patch(current: &Task, patch: &Value) -> HubResult<Task> {
    if !patch.is_object() {
        return Err(HubError::bad_request("补丁必须是 JSON 对象"));
    }
    let document = data::merge(&serde_json::to_value(current)?, patch);
    serde_json::from_value(document).map_err(|e| HubError::bad_request(e.to_string()))
}

/// 把任务与报告引用的文件标记为立即过期，由文件回收器删除
pub(crate) async fn expire_attachments(
    gateway: &PersistenceGateway,
    task: &Task,
    report: Option<&TaskReport>,
) -> HubResult<()> {
    let now = Utc::now();
    let report_attached = report.iter().flat_map(|r| r.attached.iter());
    for attachment in task.attached.iter().chain(report_attached) {
        match gateway.files.set_expiration(attachment.id, Some(now)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn dashboard_row(task: Task, report: Option<TaskReport>) -> TaskDashboard {
    let report_errors = report.as_ref().map(|r| r.errors.len()).unwrap_or(0);
    TaskDashboard {
        id: task.id,
        errors: task.errors.len() + report_errors,
        status: report.as_ref().map(|r| r.status),
        total: report.as_ref().map(|r| r.total).unwrap_or(0),
        completed: report.as_ref().map(|r| r.completed).unwrap_or(0),
        name: task.name,
        kind: task.kind,
        addon: task.addon,
        state: task.state,
        locator: task.locator,
        create_user: task.create_user,
        application: task.application,
        platform: task.platform,
        started: task.started,
        terminated: task.terminated,
    }
}
