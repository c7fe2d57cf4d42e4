use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("缺少环境变量: {0}")]
    MissingEnv(&'static str),

    #[error("无效的环境变量 {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Hub 连接错误: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Hub 返回 HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WorkerError::Status { status: 404, .. })
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;
