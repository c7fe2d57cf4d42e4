//! 持久化网关接口
//!
//! 每个仓储只负责一种实体；跨实体的写操作（任务及其事件、任务组及其成员）
//! 在实现内部以单个事务完成。
//!
//! ## 并发约定
//!
//! 任务行带有 `version` 列。[`TaskRepository::update`] 仅在版本匹配时写入，
//! 否则返回 [`HubError::Conflict`](crate::errors::HubError::Conflict)，
//! 由调用方决定跳过或重新读取后重试。

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::HubResult;
use crate::models::{
    Bucket, FileRecord, ListQuery, Page, QueueReport, Task, TaskGroup, TaskReport, TaskState,
};

/// 任务仓储
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 创建任务（连同事件），分配新的 id，返回 `version = 1` 的任务
    async fn create(&self, task: &Task) -> HubResult<Task>;

    async fn get(&self, id: i64) -> HubResult<Option<Task>>;

    /// 按乐观版本号保存任务与事件，返回递增版本后的任务
    async fn update(&self, task: &Task) -> HubResult<Task>;

    /// 删除任务及其事件和报告，不存在时返回 false
    async fn delete(&self, id: i64) -> HubResult<bool>;

    /// 按过滤条件分页查询，`total` 为未分页的总数
    async fn list(&self, query: &ListQuery) -> HubResult<Page<Task>>;

    /// 按状态查询，排序为 (priority desc, id asc)
    async fn list_by_states(&self, states: &[TaskState]) -> HubResult<Vec<Task>>;

    /// 已终止但仍持有 Pod 的任务（等待清理）
    async fn list_with_pod(&self) -> HubResult<Vec<Task>>;

    /// 任务组成员，按声明顺序（id asc）
    async fn list_by_group(&self, group_id: i64) -> HubResult<Vec<Task>>;

    /// 各排队状态的计数，可按 addon 过滤
    async fn queue_counts(&self, addon: Option<&str>) -> HubResult<QueueReport>;

    /// 根据 worker 令牌查找任务 id
    async fn find_by_token(&self, token: &str) -> HubResult<Option<i64>>;
}

/// 任务报告仓储
#[async_trait]
pub trait ReportRepository: Send + Sync {
    async fn get(&self, task_id: i64) -> HubResult<Option<TaskReport>>;

    /// 插入或覆盖任务的报告
    async fn save(&self, report: &TaskReport) -> HubResult<()>;

    async fn delete(&self, task_id: i64) -> HubResult<bool>;
}

/// 任务组仓储
#[async_trait]
pub trait TaskGroupRepository: Send + Sync {
    /// 在同一事务中创建任务组及其成员任务
    async fn create(&self, group: &TaskGroup) -> HubResult<TaskGroup>;

    /// 返回任务组及其成员
    async fn get(&self, id: i64) -> HubResult<Option<TaskGroup>>;

    /// 保存任务组；`group.tasks` 中 id 为 0 的成员被创建，其余按版本号更新，
    /// 不再出现在列表中的成员被删除
    async fn update(&self, group: &TaskGroup) -> HubResult<TaskGroup>;

    async fn list(&self, query: &ListQuery) -> HubResult<Page<TaskGroup>>;

    /// 尚未达到聚合终态或等待删除的任务组
    async fn list_active(&self) -> HubResult<Vec<TaskGroup>>;

    /// 只更新聚合状态，不触碰成员
    async fn set_state(&self, id: i64, state: TaskState) -> HubResult<()>;

    /// 标记等待删除，由任务管理器在成员全部终止后完成删除
    async fn request_delete(&self, id: i64) -> HubResult<bool>;

    /// 在同一事务中删除任务组及其成员
    async fn delete(&self, id: i64) -> HubResult<bool>;
}

/// Bucket 仓储
#[async_trait]
pub trait BucketRepository: Send + Sync {
    /// 分配 id 并以 `root/<id>` 作为路径
    async fn create(&self, root: &Path, create_user: &str) -> HubResult<Bucket>;

    async fn get(&self, id: i64) -> HubResult<Option<Bucket>>;

    async fn list(&self) -> HubResult<Vec<Bucket>>;

    async fn delete(&self, id: i64) -> HubResult<bool>;

    async fn set_expiration(&self, id: i64, expiration: Option<DateTime<Utc>>) -> HubResult<()>;

    /// 被任务或任务组引用的 bucket id
    async fn referenced(&self) -> HubResult<HashSet<i64>>;
}

/// 文件仓储
#[async_trait]
pub trait FileRepository: Send + Sync {
    /// 分配 id 并以 `root/<id>` 作为路径
    async fn create(
        &self,
        name: &str,
        encoding: &str,
        root: &Path,
        create_user: &str,
    ) -> HubResult<FileRecord>;

    async fn get(&self, id: i64) -> HubResult<Option<FileRecord>>;

    async fn list(&self) -> HubResult<Vec<FileRecord>>;

    async fn delete(&self, id: i64) -> HubResult<bool>;

    async fn set_expiration(&self, id: i64, expiration: Option<DateTime<Utc>>) -> HubResult<()>;

    async fn list_expired(&self, now: DateTime<Utc>) -> HubResult<Vec<FileRecord>>;
}
