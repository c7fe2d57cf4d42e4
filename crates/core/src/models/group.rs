use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::data;
use super::task::{Task, TaskPolicy, TaskState};
use crate::errors::{HubError, HubResult};

/// 任务组模式
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum GroupMode {
    #[default]
    Batch,
    Pipeline,
}

impl GroupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupMode::Batch => "Batch",
            GroupMode::Pipeline => "Pipeline",
        }
    }
}

impl fmt::Display for GroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupMode {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "Batch" => Ok(GroupMode::Batch),
            "Pipeline" => Ok(GroupMode::Pipeline),
            other => Err(HubError::bad_request(format!("无效的任务组模式: {other}"))),
        }
    }
}

/// 任务组
///
/// 组内成员共享组的 bucket；提交时组的 kind/addon/extensions/data 作为默认值合并到成员中。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskGroup {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub addon: String,
    pub extensions: Vec<String>,
    pub priority: i32,
    pub policy: TaskPolicy,
    pub mode: GroupMode,
    pub state: TaskState,
    pub bucket_id: Option<i64>,
    pub data: Value,
    pub delete_requested: bool,
    pub create_user: String,
    pub create_time: DateTime<Utc>,
    pub tasks: Vec<Task>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            kind: String::new(),
            addon: String::new(),
            extensions: Vec::new(),
            priority: 0,
            policy: TaskPolicy::default(),
            mode: GroupMode::Batch,
            state: TaskState::Created,
            bucket_id: None,
            data: Value::Object(Default::default()),
            delete_requested: false,
            create_user: String::new(),
            create_time: Utc::now(),
            tasks: Vec::new(),
        }
    }
}

impl TaskGroup {
    /// 组状态只允许 Created、Ready 或聚合终态
    pub fn validate_state(state: TaskState) -> HubResult<()> {
        match state {
            TaskState::Created | TaskState::Ready => Ok(()),
            other => Err(HubError::bad_request(format!(
                "任务组状态必须为 Created 或 Ready: {other}"
            ))),
        }
    }

    /// 将组的默认值填充到成员任务中，成员自身的值优先
    pub fn propagate(&self, task: &mut Task) {
        if task.kind.is_empty() {
            task.kind = self.kind.clone();
        }
        if task.addon.is_empty() {
            task.addon = self.addon.clone();
        }
        if task.extensions.is_empty() {
            task.extensions = self.extensions.clone();
        }
        if task.priority == 0 {
            task.priority = self.priority;
        }
        if task.policy == TaskPolicy::default() {
            task.policy = self.policy.clone();
        }
        if task.create_user.is_empty() {
            task.create_user = self.create_user.clone();
        }
        task.data = data::merge(&self.data, &task.data);
        task.bucket_id = self.bucket_id;
        task.task_group_id = Some(self.id);
    }

    /// 所有成员终止后的聚合状态: Failed > Canceled > Succeeded
    pub fn aggregate_state(members: &[Task]) -> Option<TaskState> {
        if members.is_empty() || !members.iter().all(Task::is_terminal) {
            return None;
        }
        if members.iter().any(|t| t.state == TaskState::Failed) {
            return Some(TaskState::Failed);
        }
        if members.iter().any(|t| t.state == TaskState::Canceled) {
            return Some(TaskState::Canceled);
        }
        Some(TaskState::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_propagate_defaults() {
        let group = TaskGroup {
            id: 3,
            kind: "analyze".into(),
            addon: "analyzer".into(),
            priority: 20,
            bucket_id: Some(9),
            data: json!({"mode": {"binary": false}, "tagger": {"enabled": true}}),
            ..Default::default()
        };
        let mut task = Task::new("member");
        task.addon = "custom".into();
        task.data = json!({"mode": {"binary": true}});
        group.propagate(&mut task);

        assert_eq!(task.kind, "analyze");
        assert_eq!(task.addon, "custom");
        assert_eq!(task.priority, 20);
        assert_eq!(task.bucket_id, Some(9));
        assert_eq!(task.task_group_id, Some(3));
        assert_eq!(task.data["mode"]["binary"], true);
        assert_eq!(task.data["tagger"]["enabled"], true);
    }

    #[test]
    fn test_aggregate_state() {
        let mut a = Task::new("a");
        let mut b = Task::new("b");
        a.state = TaskState::Succeeded;
        b.state = TaskState::Running;
        assert_eq!(TaskGroup::aggregate_state(&[a.clone(), b.clone()]), None);
        b.state = TaskState::Canceled;
        assert_eq!(
            TaskGroup::aggregate_state(&[a.clone(), b.clone()]),
            Some(TaskState::Canceled)
        );
        a.state = TaskState::Failed;
        assert_eq!(
            TaskGroup::aggregate_state(&[a, b]),
            Some(TaskState::Failed)
        );
        assert_eq!(TaskGroup::aggregate_state(&[]), None);
    }

    #[test]
    fn test_validate_state() {
        assert!(TaskGroup::validate_state(TaskState::Ready).is_ok());
        assert!(TaskGroup::validate_state(TaskState::Running).is_err());
    }
}
