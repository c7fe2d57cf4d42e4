use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 持久化的命名文件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: i64,
    pub name: String,
    pub encoding: String,
    pub path: String,
    pub expiration: Option<DateTime<Utc>>,
    pub create_user: String,
    pub create_time: DateTime<Utc>,
}
