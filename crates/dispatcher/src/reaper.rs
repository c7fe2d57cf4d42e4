//! 回收器：过期任务、孤立 bucket 与过期文件
//!
//! - 任务：Created 超过 ttl.created 删除（Pipeline 成员除外）；排队超过 ttl.pending 删除；
//!   Succeeded/Failed 超过各自 TTL 删除，否则在释放周期后放弃 bucket 与附件。
//! - bucket：不再被任务或任务组引用时设置过期时间，到期后删除；重新被引用则清除过期时间。
//! - 文件：到期后删除内容与记录。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use taskhub_core::config::{BucketConfig, ReaperConfig};
use taskhub_core::models::{event, GroupMode, ListQuery, Task, TaskState};
use taskhub_core::traits::ClusterDriver;
use taskhub_core::{HubError, HubResult};
use taskhub_infrastructure::{BucketStore, FileStore, MetricsCollector, StructuredLogger};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::gateway::PersistenceGateway;
use crate::service::expire_attachments;

/// 一次回收的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub tasks_deleted: usize,
    pub tasks_released: usize,
    pub buckets_marked: usize,
    pub buckets_deleted: usize,
    pub files_deleted: usize,
}

enum Verdict {
    Keep,
    Delete(&'static str),
    Release,
}

pub struct Reaper {
    gateway: PersistenceGateway,
    cluster: Arc<dyn ClusterDriver>,
    files: FileStore,
    buckets: BucketStore,
    config: ReaperConfig,
    bucket: BucketConfig,
    metrics: Arc<MetricsCollector>,
}

impl Reaper {
    pub fn new(
        gateway: PersistenceGateway,
        cluster: Arc<dyn ClusterDriver>,
        files: FileStore,
        buckets: BucketStore,
        config: ReaperConfig,
        bucket: BucketConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            gateway,
            cluster,
            files,
            buckets,
            config,
            bucket,
            metrics,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("启动回收器，间隔 {}s", self.config.interval_seconds);
        let mut ticker = tokio::time::interval(StdDuration::from_secs(self.config.interval_seconds));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(summary) if summary != ReapSummary::default() => {
                            info!("回收完成: {:?}", summary);
                        }
                        Ok(_) => {}
                        Err(e) => StructuredLogger::log_system_error("reaper", "run", &e),
                    }
                }
                _ = shutdown.recv() => {
                    info!("回收器收到关闭信号");
                    break;
                }
            }
        }
    }

    /// 依次回收任务、bucket 和文件
    pub async fn run_once(&self) -> HubResult<ReapSummary> {
        let now = Utc::now();
        let mut summary = ReapSummary::default();
        self.reap_tasks(now, &mut summary).await?;
        self.reap_buckets(now, &mut summary).await?;
        self.reap_files(now, &mut summary).await?;
        let removed = summary.tasks_deleted + summary.buckets_deleted + summary.files_deleted;
        if removed > 0 {
            self.metrics.record_reaped(removed as u64);
        }
        Ok(summary)
    }

    async fn reap_tasks(&self, now: DateTime<Utc>, summary: &mut ReapSummary) -> HubResult<()> {
        let tasks = self.gateway.tasks.list(&ListQuery::default()).await?.items;
        let mut modes: HashMap<i64, Option<GroupMode>> = HashMap::new();
        for task in tasks {
            let pipeline = match task.task_group_id {
                Some(group_id) => {
                    if !modes.contains_key(&group_id) {
                        let mode = self.gateway.groups.get(group_id).await?.map(|g| g.mode);
                        modes.insert(group_id, mode);
                    }
                    modes.get(&group_id).copied().flatten() == Some(GroupMode::Pipeline)
                }
                None => false,
            };
            let result = match self.verdict(&task, pipeline, now) {
                Verdict::Keep => continue,
                Verdict::Delete(reason) => self.delete_task(&task, reason).await.map(|_| {
                    summary.tasks_deleted += 1;
                }),
                Verdict::Release => self.release_task(task.clone()).await.map(|_| {
                    summary.tasks_released += 1;
                }),
            };
            match result {
                Ok(()) => {}
                Err(HubError::Conflict(_)) => debug!("任务 {} 正在被修改，下次再回收", task.id),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn verdict(&self, task: &Task, pipeline: bool, now: DateTime<Utc>) -> Verdict {
        let elapsed = |mark: DateTime<Utc>, minutes: i64| {
            minutes > 0 && now - mark > Duration::minutes(minutes)
        };
        match task.state {
            TaskState::Created => {
                let ttl = if task.ttl.created > 0 {
                    task.ttl.created
                } else {
                    self.config.created_minutes
                };
                if !pipeline && elapsed(task.create_time, ttl) {
                    return Verdict::Delete("ttl.created");
                }
                Verdict::Keep
            }
            TaskState::Ready
            | TaskState::Postponed
            | TaskState::QuotaBlocked
            | TaskState::Pending => {
                if elapsed(task.create_time, task.ttl.pending) {
                    return Verdict::Delete("ttl.pending");
                }
                Verdict::Keep
            }
            TaskState::Running => Verdict::Keep,
            TaskState::Succeeded | TaskState::Failed | TaskState::Canceled => {
                let terminated = task.terminated.unwrap_or(task.create_time);
                let (ttl, release) = match task.state {
                    TaskState::Succeeded => (task.ttl.succeeded, self.config.succeeded_minutes),
                    _ => (task.ttl.failed, self.config.failed_minutes),
                };
                if task.state != TaskState::Canceled && elapsed(terminated, ttl) {
                    return Verdict::Delete("ttl.terminal");
                }
                let held = task.bucket_id.is_some() || !task.attached.is_empty();
                if !task.reaped && held && task.pod.is_none() && elapsed(terminated, release) {
                    return Verdict::Release;
                }
                Verdict::Keep
            }
        }
    }

    async fn delete_task(&self, task: &Task, reason: &str) -> HubResult<()> {
        if let Some(pod) = &task.pod {
            match self.cluster.delete_pod(pod).await {
                Ok(_) => StructuredLogger::log_pod_deleted(Some(task.id), pod, reason),
                Err(e) => warn!("删除任务 {} 的Pod {} 失败，留给孤儿清理: {}", task.id, pod, e),
            }
        }
        let report = self.gateway.reports.get(task.id).await?;
        expire_attachments(&self.gateway, task, report.as_ref()).await?;
        self.gateway.tasks.delete(task.id).await?;
        StructuredLogger::log_reaped("task", task.id, reason);
        Ok(())
    }

    /// 放弃 bucket 引用与附件，任务本身保留
    async fn release_task(&self, mut task: Task) -> HubResult<()> {
        let report = self.gateway.reports.get(task.id).await?;
        expire_attachments(&self.gateway, &task, report.as_ref()).await?;
        task.bucket_id = None;
        task.attached.clear();
        task.reaped = true;
        task.event(event::RELEASED, "reaper");
        self.gateway.tasks.update(&task).await?;
        StructuredLogger::log_reaped("task", task.id, "released");
        Ok(())
    }

    async fn reap_buckets(&self, now: DateTime<Utc>, summary: &mut ReapSummary) -> HubResult<()> {
        let referenced = self.gateway.buckets.referenced().await?;
        for bucket in self.gateway.buckets.list().await? {
            if referenced.contains(&bucket.id) {
                if bucket.expiration.is_some() {
                    self.gateway.buckets.set_expiration(bucket.id, None).await?;
                    debug!("bucket {} 重新被引用", bucket.id);
                }
                continue;
            }
            match bucket.expiration {
                None => {
                    let expiration = now + Duration::minutes(self.bucket.ttl_minutes);
                    self.gateway
                        .buckets
                        .set_expiration(bucket.id, Some(expiration))
                        .await?;
                    summary.buckets_marked += 1;
                }
                Some(expiration) if expiration <= now => {
                    if let Err(e) = self.buckets.delete(&bucket, "").await {
                        warn!("删除 bucket 目录 {} 失败: {}", bucket.path, e);
                        continue;
                    }
                    self.gateway.buckets.delete(bucket.id).await?;
                    StructuredLogger::log_reaped("bucket", bucket.id, "expired");
                    summary.buckets_deleted += 1;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn reap_files(&self, now: DateTime<Utc>, summary: &mut ReapSummary) -> HubResult<()> {
        for file in self.gateway.files.list_expired(now).await? {
            if let Err(e) = self.files.remove(&file).await {
                warn!("删除文件 {} 内容失败: {}", file.path, e);
                continue;
            }
            self.gateway.files.delete(file.id).await?;
            StructuredLogger::log_reaped("file", file.id, "expired");
            summary.files_deleted += 1;
        }
        Ok(())
    }
}
