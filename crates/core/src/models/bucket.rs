use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 内容目录
///
/// `expiration` 由 bucket 回收器设置：未被任何任务或任务组引用的 bucket 到期后删除。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub id: i64,
    pub path: String,
    pub expiration: Option<DateTime<Utc>>,
    pub create_user: String,
    pub create_time: DateTime<Utc>,
}
