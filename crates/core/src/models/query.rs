use serde::{Deserialize, Serialize};

/// 过滤操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    NotEq,
    /// glob 匹配
    Like,
}

/// 单个过滤谓词，`values` 之间为 OR 关系
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub op: FilterOp,
    pub values: Vec<String>,
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            values: vec![value.into()],
        }
    }
}

/// 列表查询：谓词之间为 AND 关系
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub predicates: Vec<Predicate>,
    pub limit: Option<i64>,
    pub offset: i64,
}

impl ListQuery {
    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn is_paged(&self) -> bool {
        self.limit.is_some()
    }
}

/// 分页结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

/// 队列报告：各排队状态的任务数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueReport {
    pub ready: i64,
    pub postponed: i64,
    pub pending: i64,
    pub quota_blocked: i64,
    pub running: i64,
    pub total: i64,
}
