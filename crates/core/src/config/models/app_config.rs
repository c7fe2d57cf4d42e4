use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    api_observability::{ApiConfig, ObservabilityConfig},
    cluster::ClusterConfig,
    database::DatabaseConfig,
    manager::{HubConfig, ManagerConfig, ReaperConfig, ReporterConfig},
    storage::{BucketConfig, FileConfig},
};

/// 系统配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub hub: HubConfig,
    pub manager: ManagerConfig,
    pub reaper: ReaperConfig,
    pub bucket: BucketConfig,
    pub file: FileConfig,
    pub reporter: ReporterConfig,
    pub cluster: ClusterConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序:
    /// 1. 默认配置
    /// 2. 配置文件（TOML）
    /// 3. 环境变量覆盖（前缀 `TASKHUB_`，层级分隔符 `__`，
    ///    例如 `TASKHUB_MANAGER__MAX_RUNNING=20`）
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder()
            .set_default("database.url", "sqlite://data/taskhub.db")?
            .set_default("api.bind_address", "0.0.0.0:8080")?
            .set_default("observability.log_level", "info")?;

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/taskhub.toml",
                "taskhub.toml",
                "/etc/taskhub/config.toml",
            ];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKHUB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// 序列化为 TOML 字符串
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.hub.validate().context("Hub配置验证失败")?;
        self.manager.validate().context("任务管理器配置验证失败")?;
        self.reaper.validate().context("回收器配置验证失败")?;
        self.bucket.validate().context("Bucket配置验证失败")?;
        self.file.validate().context("文件配置验证失败")?;
        self.reporter.validate().context("上报配置验证失败")?;
        self.cluster.validate().context("集群配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reporter.min_backoff_ms, 100);
        assert_eq!(config.reporter.max_backoff_ms, 1000);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = AppConfig::from_toml(
            r#"
[manager]
max_running = 2
max_retries = 1

[[cluster.nodes]]
name = "n1"
capacity = 2

[[cluster.addons]]
name = "analyzer"
image = "quay.io/konveyor/analyzer"
tasks = ["analysis"]
"#,
        )
        .unwrap();
        assert_eq!(config.manager.max_running, 2);
        assert_eq!(config.manager.tick_interval_ms, 1000);
        assert_eq!(config.cluster.nodes[0].name, "n1");
        assert!(config.cluster.addons[0].handles("analysis"));
    }

    #[test]
    fn test_validation_rejects_bad_backoff() {
        let mut config = AppConfig::default();
        config.reporter.min_backoff_ms = 2000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.manager.tick_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.hub.auth_enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.api.bind_address, config.api.bind_address);
    }
}
