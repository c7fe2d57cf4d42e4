//! 工作区共享的测试工具
//!
//! - [`TaskBuilder`] / [`GroupBuilder`]：测试数据构建器
//! - [`TestHarness`]：真实 SQLite + 模拟集群 + 各服务组成的集成测试环境
//! - [`TestEnv`]：条件等待与日志初始化
//!
//! ```toml
//! [dev-dependencies]
//! taskhub-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod harness;
pub mod helpers;

pub use builders::*;
pub use harness::*;
pub use helpers::*;
