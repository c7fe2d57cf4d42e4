//! 任务编排核心：领域模型、错误、配置以及持久化和集群接口

pub mod backoff;
pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use errors::{HubError, HubResult};
