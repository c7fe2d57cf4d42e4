use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;

/// Hub 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// worker 回调地址（注入到 Pod 的 HUB_URL）
    pub url: String,
    pub namespace: String,
    pub auth_enabled: bool,
    pub admin_token: Option<String>,
    pub shared_dir: String,
    pub cache_dir: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            namespace: "taskhub".to_string(),
            auth_enabled: false,
            admin_token: None,
            shared_dir: "/shared".to_string(),
            cache_dir: "/cache".to_string(),
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("Hub URL不能为空"));
        }
        if self.namespace.is_empty() {
            return Err(anyhow::anyhow!("命名空间不能为空"));
        }
        if self.auth_enabled && self.admin_token.as_deref().unwrap_or("").is_empty() {
            return Err(anyhow::anyhow!("启用认证时必须配置管理员令牌"));
        }
        Ok(())
    }
}

/// 任务管理器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub tick_interval_ms: u64,
    pub max_retries: i32,
    /// 全局最大运行数
    pub max_running: u32,
    /// 按任务类型的最大运行数
    pub kind_caps: HashMap<String, u32>,
    pub preemption_enabled: bool,
    /// Pending 且不可调度超过该时长后重试
    pub unschedulable_backoff_seconds: u64,
    pub pod_retention_succeeded_seconds: u64,
    pub pod_retention_failed_seconds: u64,
    pub event_pump_interval_ms: u64,
    /// 集群调用的最大并发
    pub fanout_ceiling: usize,
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_retries: 3,
            max_running: 10,
            kind_caps: HashMap::new(),
            preemption_enabled: true,
            unschedulable_backoff_seconds: 60,
            pod_retention_succeeded_seconds: 0,
            pod_retention_failed_seconds: 0,
            event_pump_interval_ms: 500,
            fanout_ceiling: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度间隔必须大于0"));
        }
        if self.max_retries < 0 {
            return Err(anyhow::anyhow!("最大重试次数不能为负数"));
        }
        if self.max_running == 0 {
            return Err(anyhow::anyhow!("最大运行数必须大于0"));
        }
        if self.event_pump_interval_ms == 0 {
            return Err(anyhow::anyhow!("事件拉取间隔必须大于0"));
        }
        if self.fanout_ceiling == 0 {
            return Err(anyhow::anyhow!("并发上限必须大于0"));
        }
        self.retry.validate()
    }
}

/// 回收器配置（时间单位：分钟）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_seconds: u64,
    pub created_minutes: i64,
    pub succeeded_minutes: i64,
    pub failed_minutes: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            created_minutes: 72 * 60,
            succeeded_minutes: 72 * 60,
            failed_minutes: 30 * 24 * 60,
        }
    }
}

impl ReaperConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("回收间隔必须大于0"));
        }
        if self.created_minutes < 0 || self.succeeded_minutes < 0 || self.failed_minutes < 0 {
            return Err(anyhow::anyhow!("回收周期不能为负数"));
        }
        Ok(())
    }
}

/// 上报节流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            min_backoff_ms: 100,
            max_backoff_ms: 1000,
        }
    }
}

impl ReporterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_backoff_ms == 0 {
            return Err(anyhow::anyhow!("最小退避时间必须大于0"));
        }
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(anyhow::anyhow!("最小退避时间不能大于最大退避时间"));
        }
        Ok(())
    }
}
