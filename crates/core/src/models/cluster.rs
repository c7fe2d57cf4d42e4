use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::HubError;

/// Pod 引用，序列化为 `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for PodRef {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(PodRef::new(ns, name)),
            _ => Err(HubError::bad_request(format!("无效的 Pod 引用: {s}"))),
        }
    }
}

impl From<PodRef> for String {
    fn from(pod: PodRef) -> Self {
        pod.to_string()
    }
}

impl TryFrom<String> for PodRef {
    type Error = HubError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Addon 定义（集群注册表）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AddonSpec {
    pub name: String,
    pub image: String,
    /// 可处理的任务类型（glob）
    pub tasks: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl AddonSpec {
    pub fn handles(&self, kind: &str) -> bool {
        self.tasks.iter().any(|pattern| glob_match(pattern, kind))
    }
}

/// Extension 定义
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtensionSpec {
    pub name: String,
    pub image: String,
    /// 适用的 addon（glob）
    pub addon: String,
    pub env: BTreeMap<String, String>,
    /// 适用的任务类型（glob），为空表示不限
    pub tasks: Vec<String>,
}

impl ExtensionSpec {
    pub fn applies_to(&self, addon: &str) -> bool {
        self.addon.is_empty() || glob_match(&self.addon, addon)
    }

    pub fn handles(&self, kind: &str) -> bool {
        self.tasks.is_empty() || self.tasks.iter().any(|p| glob_match(p, kind))
    }
}

/// 任务类型定义
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KindSpec {
    pub name: String,
    pub priority: i32,
    /// 同一主体上必须先完成的任务类型
    pub dependencies: Vec<String>,
    /// 默认数据，被任务数据覆盖
    pub data: Value,
    /// 在节点容量中所占的权重
    pub weight: u32,
    /// 同一时刻该类型的最大运行数，0 表示不限
    pub max_running: u32,
}

impl Default for KindSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            priority: 0,
            dependencies: Vec::new(),
            data: Value::Object(Default::default()),
            weight: 1,
            max_running: 0,
        }
    }
}

/// 节点容量
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeCapacity {
    pub name: String,
    pub capacity: u32,
}

/// 容器定义
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
}

/// 创建 Pod 的请求
///
/// 第一个容器为 addon，其后为各个 extension。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodSpec {
    pub task_id: i64,
    pub name: String,
    pub node: Option<String>,
    pub containers: Vec<ContainerSpec>,
    pub labels: BTreeMap<String, String>,
}

/// 失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureReason {
    ImagePull(String),
    Killed(String),
    Exit(i32),
    Other(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ImagePull(m) => write!(f, "ImagePull: {m}"),
            FailureReason::Killed(m) => write!(f, "Killed: {m}"),
            FailureReason::Exit(code) => write!(f, "Exit code: {code}"),
            FailureReason::Other(m) => f.write_str(m),
        }
    }
}

/// Pod 运行阶段
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodStatus {
    Pending { reason: String },
    Unschedulable { reason: String },
    Running,
    Succeeded,
    Failed { reason: FailureReason },
    Unknown,
}

impl PodStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, PodStatus::Succeeded | PodStatus::Failed { .. })
    }

    pub fn phase(&self) -> &'static str {
        match self {
            PodStatus::Pending { .. } | PodStatus::Unschedulable { .. } => "Pending",
            PodStatus::Running => "Running",
            PodStatus::Succeeded => "Succeeded",
            PodStatus::Failed { .. } => "Failed",
            PodStatus::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerState {
    pub name: String,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub reason: String,
}

/// 集群中 Pod 的当前状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodState {
    pub pod: PodRef,
    pub task_id: Option<i64>,
    pub node: Option<String>,
    pub status: PodStatus,
    pub containers: Vec<ContainerState>,
    pub created: DateTime<Utc>,
}

/// Pod 事件类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodEventKind {
    Created,
    Scheduled,
    Unschedulable,
    Started,
    Terminated,
    Deleted,
}

/// 集群事件流中的一条 Pod 事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodEvent {
    pub seq: u64,
    pub pod: PodRef,
    pub task_id: Option<i64>,
    pub kind: PodEventKind,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// 一批 Pod 事件及续读令牌
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PodEventBatch {
    pub events: Vec<PodEvent>,
    pub resume: u64,
}

/// glob 匹配，非法模式按字面量比较
pub fn glob_match(pattern: &str, value: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(value),
        Err(_) => pattern == value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_ref_roundtrip() {
        let pod: PodRef = "konveyor/task-1-abc".parse().unwrap();
        assert_eq!(pod.namespace, "konveyor");
        assert_eq!(pod.to_string(), "konveyor/task-1-abc");
        assert!("nope".parse::<PodRef>().is_err());
        let json = serde_json::to_string(&pod).unwrap();
        assert_eq!(json, "\"konveyor/task-1-abc\"");
    }

    #[test]
    fn test_addon_selection_glob() {
        let addon = AddonSpec {
            name: "analyzer".into(),
            tasks: vec!["analy*".into()],
            ..Default::default()
        };
        assert!(addon.handles("analysis"));
        assert!(!addon.handles("language-discovery"));

        let ext = ExtensionSpec {
            name: "java".into(),
            addon: "analyzer".into(),
            ..Default::default()
        };
        assert!(ext.applies_to("analyzer"));
        assert!(!ext.applies_to("tackle"));
    }
}
