//! 测试数据构建器

use chrono::{DateTime, Utc};
use serde_json::Value;
use taskhub_core::models::{GroupMode, Ref, Task, TaskGroup, TaskPolicy, TaskState, Ttl};

/// 任务构建器，默认 addon 为 `analyzer`
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(name: &str) -> Self {
        let mut task = Task::new(name);
        task.addon = "analyzer".to_string();
        Self { task }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.task.id = id;
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.task.kind = kind.to_string();
        self
    }

    pub fn with_addon(mut self, addon: &str) -> Self {
        self.task.addon = addon.to_string();
        self
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.task.extensions = extensions.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.task.state = state;
        self
    }

    pub fn with_locator(mut self, locator: &str) -> Self {
        self.task.locator = locator.to_string();
        self
    }

    pub fn with_application(mut self, id: i64) -> Self {
        self.task.application = Some(Ref {
            id,
            name: format!("app-{id}"),
        });
        self
    }

    pub fn with_policy(mut self, policy: TaskPolicy) -> Self {
        self.task.policy = policy;
        self
    }

    pub fn preemptible(mut self) -> Self {
        self.task.policy.preempt_enabled = true;
        self
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.task.ttl = ttl;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.task.data = data;
        self
    }

    pub fn with_started(mut self, started: DateTime<Utc>) -> Self {
        self.task.started = Some(started);
        self
    }

    pub fn created_at(mut self, time: DateTime<Utc>) -> Self {
        self.task.create_time = time;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// 任务组构建器
pub struct GroupBuilder {
    group: TaskGroup,
}

impl GroupBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            group: TaskGroup {
                name: name.to_string(),
                addon: "analyzer".to_string(),
                ..Default::default()
            },
        }
    }

    pub fn pipeline(mut self) -> Self {
        self.group.mode = GroupMode::Pipeline;
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.group.kind = kind.to_string();
        self
    }

    pub fn with_addon(mut self, addon: &str) -> Self {
        self.group.addon = addon.to_string();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.group.data = data;
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.group.state = state;
        self
    }

    /// 追加一个只有名字的成员，其余字段由组默认值填充
    pub fn with_member(mut self, name: &str) -> Self {
        self.group.tasks.push(Task::new(name));
        self
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.group.tasks.push(task);
        self
    }

    pub fn build(self) -> TaskGroup {
        self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let task = TaskBuilder::new("t1")
            .with_kind("analyze")
            .with_priority(20)
            .with_application(3)
            .preemptible()
            .build();
        assert_eq!(task.addon, "analyzer");
        assert_eq!(task.subject().as_deref(), Some("A:3"));
        assert!(task.policy.preemptible());

        let group = GroupBuilder::new("g").pipeline().with_member("a").with_member("b").build();
        assert_eq!(group.mode, GroupMode::Pipeline);
        assert_eq!(group.tasks.len(), 2);
    }
}
