//! Taskhub 进程装配：按运行模式启动 REST 服务、任务管理器与后台回收。

pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application};
pub use shutdown::ShutdownManager;
