use thiserror::Error;

use crate::models::TaskState;

/// 任务编排错误类型定义
#[derive(Debug, Error)]
pub enum HubError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{kind} 未找到: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("Addon: '{0}' not-found.")]
    AddonNotFound(String),

    #[error("Extension: '{0}' not-found.")]
    ExtensionNotFound(String),

    #[error("Task (kind): '{0}' not-found.")]
    KindNotFound(String),

    #[error("非法的状态迁移: {from} -> {to}")]
    IllegalTransition { from: TaskState, to: TaskState },

    #[error("冲突: {0}")]
    Conflict(String),

    #[error("禁止访问: {0}")]
    Forbidden(String),

    #[error("未认证: {0}")]
    Unauthorized(String),

    #[error("集群错误: {0}")]
    Cluster(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl HubError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        HubError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        HubError::BadRequest(reason.into())
    }

    /// 实体不存在（包括数据库 RowNotFound）
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HubError::NotFound { .. } | HubError::Database(sqlx::Error::RowNotFound)
        )
    }

    /// 调用方输入错误，映射为 400
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            HubError::BadRequest(_)
                | HubError::AddonNotFound(_)
                | HubError::ExtensionNotFound(_)
                | HubError::KindNotFound(_)
                | HubError::IllegalTransition { .. }
        )
    }

    /// 集群瞬时错误或数据库繁忙，可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            HubError::Cluster(_) => true,
            HubError::Database(sqlx::Error::Database(e)) => {
                let msg = e.message();
                msg.contains("database is locked") || msg.contains("busy")
            }
            HubError::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type HubResult<T> = std::result::Result<T, HubError>;
