use serde::{Deserialize, Serialize};

/// Bucket 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub root: String,
    /// 孤立 bucket 的保留时间（分钟）
    pub ttl_minutes: i64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            root: "data/bucket".to_string(),
            ttl_minutes: 60,
        }
    }
}

impl BucketConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.root.is_empty() {
            return Err(anyhow::anyhow!("Bucket根目录不能为空"));
        }
        if self.ttl_minutes < 0 {
            return Err(anyhow::anyhow!("Bucket保留时间不能为负数"));
        }
        Ok(())
    }
}

/// 文件存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub root: String,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            root: "data/file".to_string(),
        }
    }
}

impl FileConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.root.is_empty() {
            return Err(anyhow::anyhow!("文件根目录不能为空"));
        }
        Ok(())
    }
}
