//! 配置管理
//!
//! 配置由默认值、TOML 文件和 `TASKHUB_` 前缀的环境变量三层叠加而成，
//! 加载后统一经过 [`AppConfig::validate`] 校验。

pub mod models;

pub use models::*;
