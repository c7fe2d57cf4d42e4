use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cluster::PodRef;
use super::report::TaskReport;
use crate::errors::{HubError, HubResult};

/// 任务事件类型
pub mod event {
    pub const ADDON_SELECTED: &str = "AddonSelected";
    pub const EXT_SELECTED: &str = "ExtSelected";
    pub const SUBMITTED: &str = "Submitted";
    pub const POD_CREATED: &str = "PodCreated";
    pub const POD_PENDING: &str = "PodPending";
    pub const POD_RUNNING: &str = "PodRunning";
    pub const POD_SUCCEEDED: &str = "PodSucceeded";
    pub const POD_FAILED: &str = "PodFailed";
    pub const POD_DELETED: &str = "PodDeleted";
    pub const POD_NOT_FOUND: &str = "PodNotFound";
    pub const POD_UNSCHEDULABLE: &str = "PodUnschedulable";
    pub const IMAGE_ERROR: &str = "ImageError";
    pub const CONTAINER_KILLED: &str = "ContainerKilled";
    pub const ADDON_FAILED: &str = "AddonFailed";
    pub const ESCALATED: &str = "Escalated";
    pub const RELEASED: &str = "Released";
    pub const PREEMPTED: &str = "Preempted";
    pub const POSTPONED: &str = "Postponed";
    pub const QUOTA_BLOCKED: &str = "QuotaBlocked";
    pub const RETRIED: &str = "Retried";
    pub const CANCELED: &str = "Canceled";
    pub const TTL_EXPIRED: &str = "TTL";
    pub const PANIC: &str = "Panic";
}

/// 任务状态
///
/// 状态迁移只允许按照 [`TaskState::can_transition_to`] 定义的边进行，
/// 终态（Succeeded/Failed/Canceled）不可离开。
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum TaskState {
    #[default]
    #[serde(alias = "")]
    Created,
    Ready,
    Postponed,
    QuotaBlocked,
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskState {
    pub const ALL: [TaskState; 9] = [
        TaskState::Created,
        TaskState::Ready,
        TaskState::Postponed,
        TaskState::QuotaBlocked,
        TaskState::Pending,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Canceled,
    ];

    /// `state=queued` 过滤别名展开的状态集合
    pub const QUEUED: [TaskState; 5] = [
        TaskState::Ready,
        TaskState::Postponed,
        TaskState::Pending,
        TaskState::QuotaBlocked,
        TaskState::Running,
    ];

    /// 等待调度器决策的状态
    pub const SCHEDULABLE: [TaskState; 3] = [
        TaskState::Ready,
        TaskState::Postponed,
        TaskState::QuotaBlocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "Created",
            TaskState::Ready => "Ready",
            TaskState::Postponed => "Postponed",
            TaskState::QuotaBlocked => "QuotaBlocked",
            TaskState::Pending => "Pending",
            TaskState::Running => "Running",
            TaskState::Succeeded => "Succeeded",
            TaskState::Failed => "Failed",
            TaskState::Canceled => "Canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Canceled
        )
    }

    /// 持有（或即将持有）Pod 的状态
    pub fn has_pod(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Running)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Canceled {
            return true;
        }
        matches!(
            (*self, next),
            (Created, Ready)
                | (Ready, Pending)
                | (Ready, Postponed)
                | (Ready, QuotaBlocked)
                | (Ready, Failed)
                | (Postponed, Ready)
                | (QuotaBlocked, Ready)
                | (Pending, Running)
                | (Pending, Ready)
                | (Pending, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Ready)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| HubError::bad_request(format!("无效的任务状态: {s}")))
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskState {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskState {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse::<TaskState>()
            .map_err(|_| format!("Invalid task state: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskState {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 调度策略
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskPolicy {
    /// 同一节点上不与同类任务共存
    pub isolated: bool,
    pub preempt_enabled: bool,
    pub preempt_exempt: bool,
}

impl TaskPolicy {
    pub fn preemptible(&self) -> bool {
        self.preempt_enabled && !self.preempt_exempt
    }
}

/// 各状态的存活时间（分钟），0 表示未设置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Ttl {
    pub created: i64,
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

/// 关联引用
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ref {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

/// 任务事件，按 (task_id, seq) 唯一
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    pub seq: i64,
    pub kind: String,
    pub count: i32,
    pub reason: String,
    pub time: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskError {
    pub severity: String,
    pub description: String,
}

/// 附件引用
///
/// `activity` 为 0 表示不关联任何 activity 行；k 表示关联第 k 行（从 1 开始）。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub activity: usize,
}

/// 任务定义
///
/// 系统中的基本工作单元：由用户提交，匹配到 addon 后在集群中以 Pod 形式运行。
///
/// # 字段说明
///
/// - `kind`/`addon`/`extensions`: 任务类型与 worker 容器
/// - `locator`: 自由格式的关联键，同一 locator 的任务不会同时运行
/// - `priority`: 优先级，越大越先运行
/// - `version`: 乐观并发版本号，每次保存递增
/// - `pod`: `namespace/name`，仅在 Pending/Running 或刚进入终态等待清理时存在
/// - `events`: 只追加的事件日志
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    pub id: i64,
    #[serde(skip)]
    pub version: i64,
    pub name: String,
    pub kind: String,
    pub addon: String,
    pub extensions: Vec<String>,
    pub locator: String,
    pub priority: i32,
    pub policy: TaskPolicy,
    pub ttl: Ttl,
    pub state: TaskState,
    pub pod: Option<PodRef>,
    pub node: Option<String>,
    pub retries: i32,
    pub started: Option<DateTime<Utc>>,
    pub terminated: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub reaped: bool,
    pub application: Option<Ref>,
    pub platform: Option<Ref>,
    pub bucket_id: Option<i64>,
    pub task_group_id: Option<i64>,
    pub create_user: String,
    pub create_time: DateTime<Utc>,
    pub update_user: String,
    pub data: Value,
    pub events: Vec<TaskEvent>,
    pub errors: Vec<TaskError>,
    pub attached: Vec<Attachment>,
    #[serde(skip)]
    pub token: Option<String>,
    pub report: Option<TaskReport>,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: 0,
            version: 0,
            name: String::new(),
            kind: String::new(),
            addon: String::new(),
            extensions: Vec::new(),
            locator: String::new(),
            priority: 0,
            policy: TaskPolicy::default(),
            ttl: Ttl::default(),
            state: TaskState::Created,
            pod: None,
            node: None,
            retries: 0,
            started: None,
            terminated: None,
            cancel_requested: false,
            reaped: false,
            application: None,
            platform: None,
            bucket_id: None,
            task_group_id: None,
            create_user: String::new(),
            create_time: Utc::now(),
            update_user: String::new(),
            data: Value::Object(Default::default()),
            events: Vec::new(),
            errors: Vec::new(),
            attached: Vec::new(),
            token: None,
            report: None,
        }
    }
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 调度规则使用的主体键: 应用 > 平台 > locator
    pub fn subject(&self) -> Option<String> {
        if let Some(app) = &self.application {
            return Some(format!("A:{}", app.id));
        }
        if let Some(platform) = &self.platform {
            return Some(format!("P:{}", platform.id));
        }
        if !self.locator.is_empty() {
            return Some(format!("L:{}", self.locator));
        }
        None
    }

    /// 追加事件
    ///
    /// 与最后一条事件的 kind 和 reason 相同时只递增计数。
    /// 同一任务的事件时间戳严格递增。
    pub fn event(&mut self, kind: &str, reason: impl Into<String>) {
        let reason = reason.into();
        let mut now = Utc::now();
        if let Some(last) = self.events.last_mut() {
            if now <= last.last {
                now = last.last + Duration::microseconds(1);
            }
            if last.kind == kind && last.reason == reason {
                last.count += 1;
                last.last = now;
                return;
            }
        }
        let seq = self.events.last().map(|e| e.seq + 1).unwrap_or(1);
        self.events.push(TaskEvent {
            seq,
            kind: kind.to_string(),
            count: 1,
            reason,
            time: now,
            last: now,
        });
    }

    pub fn error(&mut self, severity: &str, description: impl Into<String>) {
        self.errors.push(TaskError {
            severity: severity.to_string(),
            description: description.into(),
        });
    }

    /// 执行状态迁移并记录事件
    pub fn transition(
        &mut self,
        next: TaskState,
        kind: &str,
        reason: impl Into<String>,
    ) -> HubResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(HubError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            let now = Utc::now();
            let started = *self.started.get_or_insert(now);
            self.terminated = Some(now.max(started));
        }
        self.event(kind, reason);
        Ok(())
    }

    /// 关联文件（按文件 id 去重）
    pub fn attach(&mut self, file_id: i64, name: impl Into<String>) {
        if self.attached.iter().any(|a| a.id == file_id) {
            return;
        }
        self.attached.push(Attachment {
            id: file_id,
            name: name.into(),
            activity: 0,
        });
    }

    /// Running 状态是否超过 ttl.running
    pub fn running_ttl_expired(&self, now: DateTime<Utc>) -> bool {
        if self.state != TaskState::Running || self.ttl.running <= 0 {
            return false;
        }
        let mark = self.started.unwrap_or(self.create_time);
        now - mark > Duration::minutes(self.ttl.running)
    }

    /// 用户优先级: 0-9 保留给系统任务
    pub fn user_priority(priority: i32) -> i32 {
        if priority < 10 {
            priority + 10
        } else {
            priority
        }
    }
}
