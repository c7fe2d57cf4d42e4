use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::task::{Attachment, TaskError};
use crate::errors::{HubError, HubResult};

/// addon 上报的运行状态
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReportStatus {
    #[default]
    Running,
    Succeeded,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Running => "Running",
            ReportStatus::Succeeded => "Succeeded",
            ReportStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "Running" => Ok(ReportStatus::Running),
            "Succeeded" => Ok(ReportStatus::Succeeded),
            "Failed" => Ok(ReportStatus::Failed),
            other => Err(HubError::bad_request(format!("无效的上报状态: {other}"))),
        }
    }
}

/// 任务进度报告
///
/// 每个任务至多一份，由运行中的 addon 通过 [`ReportOp`] 增量更新。
/// `generation` 在每次 `Started` 时递增。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskReport {
    pub task_id: i64,
    pub generation: i64,
    pub status: ReportStatus,
    pub total: i64,
    pub completed: i64,
    pub activity: Vec<String>,
    pub errors: Vec<TaskError>,
    pub attached: Vec<Attachment>,
    pub result: Value,
    pub update_time: DateTime<Utc>,
}

/// 上报操作
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ReportOp {
    Started,
    Activity { entries: Vec<String> },
    Total { total: i64 },
    Completed { completed: i64 },
    Increment,
    Error { severity: String, description: String },
    Failed { reason: String },
    #[serde(rename_all = "camelCase")]
    Attach {
        file_id: i64,
        name: String,
        #[serde(default)]
        activity: Option<usize>,
    },
    Result { result: Value },
    Succeeded,
}

impl ReportOp {
    pub fn name(&self) -> &'static str {
        match self {
            ReportOp::Started => "started",
            ReportOp::Activity { .. } => "activity",
            ReportOp::Total { .. } => "total",
            ReportOp::Completed { .. } => "completed",
            ReportOp::Increment => "increment",
            ReportOp::Error { .. } => "error",
            ReportOp::Failed { .. } => "failed",
            ReportOp::Attach { .. } => "attach",
            ReportOp::Result { .. } => "result",
            ReportOp::Succeeded => "succeeded",
        }
    }

    pub fn is_activity(&self) -> bool {
        matches!(self, ReportOp::Activity { .. })
    }
}

impl Default for TaskReport {
    fn default() -> Self {
        Self::new(0)
    }
}

impl TaskReport {
    pub fn new(task_id: i64) -> Self {
        Self {
            task_id,
            generation: 0,
            status: ReportStatus::Running,
            total: 0,
            completed: 0,
            activity: Vec::new(),
            errors: Vec::new(),
            attached: Vec::new(),
            result: Value::Object(Map::new()),
            update_time: Utc::now(),
        }
    }

    pub fn apply(&mut self, op: ReportOp) -> HubResult<()> {
        match op {
            ReportOp::Started => {
                let generation = self.generation + 1;
                *self = TaskReport::new(self.task_id);
                self.generation = generation;
            }
            ReportOp::Activity { entries } => {
                for entry in entries {
                    for (i, line) in entry.split('\n').enumerate() {
                        if i > 0 {
                            self.activity.push(format!("> {line}"));
                        } else {
                            self.activity.push(line.to_string());
                        }
                    }
                }
            }
            ReportOp::Total { total } => {
                if total < 0 {
                    return Err(HubError::bad_request("total 不能为负数"));
                }
                if total > 0 && total < self.completed {
                    return Err(HubError::bad_request(format!(
                        "total {total} 小于已完成数 {}",
                        self.completed
                    )));
                }
                self.total = total;
            }
            ReportOp::Completed { completed } => {
                let completed = self.clamp(completed);
                if completed > self.completed {
                    self.completed = completed;
                }
            }
            ReportOp::Increment => {
                self.completed = self.clamp(self.completed + 1);
            }
            ReportOp::Error {
                severity,
                description,
            } => {
                self.errors.push(TaskError {
                    severity,
                    description,
                });
            }
            ReportOp::Failed { reason } => {
                self.status = ReportStatus::Failed;
                if !reason.is_empty() {
                    self.errors.push(TaskError {
                        severity: "Error".to_string(),
                        description: reason,
                    });
                }
            }
            ReportOp::Attach {
                file_id,
                name,
                activity,
            } => {
                if !self.attached.iter().any(|a| a.id == file_id) {
                    self.attached.push(Attachment {
                        id: file_id,
                        name,
                        activity: activity.unwrap_or(self.activity.len()),
                    });
                }
            }
            ReportOp::Result { result } => {
                if !result.is_object() {
                    return Err(HubError::bad_request("result 必须是对象"));
                }
                self.result = result;
            }
            ReportOp::Succeeded => {
                self.status = ReportStatus::Succeeded;
                if self.total == 0 {
                    self.total = self.completed;
                }
                self.completed = self.total;
            }
        }
        self.update_time = Utc::now();
        Ok(())
    }

    fn clamp(&self, completed: i64) -> i64 {
        if self.total > 0 {
            completed.min(self.total)
        } else {
            completed
        }
    }

    /// 将附件内容合并到 activity 中
    ///
    /// `contents` 按附件顺序给出文件内容。附件按 activity 索引降序插入，
    /// 索引为 0 或超出当前 activity 行数的附件被忽略。
    pub fn merge_attached(&self, contents: &[(Attachment, String)]) -> Vec<String> {
        let mut merged = self.activity.clone();
        let mut sorted: Vec<&(Attachment, String)> = contents.iter().collect();
        sorted.sort_by(|a, b| b.0.activity.cmp(&a.0.activity));
        for (attachment, content) in sorted {
            let index = attachment.activity;
            if index == 0 || index > merged.len() {
                continue;
            }
            let lines: Vec<String> = content.lines().map(|line| format!("> {line}")).collect();
            merged.splice(index..index, lines);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> TaskReport {
        let mut report = TaskReport::new(1);
        report.apply(ReportOp::Started).unwrap();
        report
    }

    #[test]
    fn test_activity_multiline() {
        let mut report = report();
        report
            .apply(ReportOp::Activity {
                entries: vec!["Fetching".into(), "line1\nline2".into()],
            })
            .unwrap();
        assert_eq!(report.activity, vec!["Fetching", "line1", "> line2"]);
    }

    #[test]
    fn test_progress_monotonic() {
        let mut report = report();
        report.apply(ReportOp::Total { total: 10 }).unwrap();
        report.apply(ReportOp::Completed { completed: 4 }).unwrap();
        report.apply(ReportOp::Completed { completed: 2 }).unwrap();
        assert_eq!(report.completed, 4);
        report.apply(ReportOp::Completed { completed: 20 }).unwrap();
        assert_eq!(report.completed, 10);
        report.apply(ReportOp::Increment).unwrap();
        assert_eq!(report.completed, 10);
        assert!(report.apply(ReportOp::Total { total: 5 }).is_err());
    }

    #[test]
    fn test_succeeded_completes() {
        let mut report = report();
        report.apply(ReportOp::Total { total: 3 }).unwrap();
        report.apply(ReportOp::Increment).unwrap();
        report.apply(ReportOp::Succeeded).unwrap();
        assert_eq!(report.status, ReportStatus::Succeeded);
        assert_eq!(report.completed, 3);
        report.apply(ReportOp::Succeeded).unwrap();
        assert_eq!(report.completed, 3);
    }

    #[test]
    fn test_started_resets() {
        let mut report = report();
        report.apply(ReportOp::Total { total: 3 }).unwrap();
        report
            .apply(ReportOp::Failed {
                reason: "boom".into(),
            })
            .unwrap();
        report.apply(ReportOp::Started).unwrap();
        assert_eq!(report.generation, 2);
        assert_eq!(report.total, 0);
        assert!(report.errors.is_empty());
        assert_eq!(report.status, ReportStatus::Running);
    }

    #[test]
    fn test_attach_and_merge() {
        let mut report = report();
        report
            .apply(ReportOp::Activity {
                entries: vec!["a".into(), "b".into()],
            })
            .unwrap();
        report
            .apply(ReportOp::Attach {
                file_id: 5,
                name: "out.log".into(),
                activity: None,
            })
            .unwrap();
        report
            .apply(ReportOp::Attach {
                file_id: 5,
                name: "dup".into(),
                activity: Some(1),
            })
            .unwrap();
        report
            .apply(ReportOp::Attach {
                file_id: 6,
                name: "first.log".into(),
                activity: Some(1),
            })
            .unwrap();
        report
            .apply(ReportOp::Attach {
                file_id: 7,
                name: "future.log".into(),
                activity: Some(9),
            })
            .unwrap();
        assert_eq!(report.attached.len(), 3);
        assert_eq!(report.attached[0].activity, 2);

        let contents: Vec<(Attachment, String)> = report
            .attached
            .iter()
            .map(|a| (a.clone(), format!("{}-x\n{}-y", a.id, a.id)))
            .collect();
        let merged = report.merge_attached(&contents);
        assert_eq!(
            merged,
            vec!["a", "> 6-x", "> 6-y", "b", "> 5-x", "> 5-y"]
        );
    }

    #[test]
    fn test_result_must_be_object() {
        let mut report = report();
        assert!(report
            .apply(ReportOp::Result {
                result: Value::from(3)
            })
            .is_err());
        report
            .apply(ReportOp::Result {
                result: serde_json::json!({"issues": 2}),
            })
            .unwrap();
        assert_eq!(report.result["issues"], 2);
    }
}
