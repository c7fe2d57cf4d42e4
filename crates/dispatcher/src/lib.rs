//! 任务编排的调度与调和
//!
//! 调度器本身是纯函数；任务管理器在每个调和周期读取持久化状态、观察集群、
//! 调用调度器并写回结果。任务、任务组和上报服务为 REST 层提供业务入口，
//! 回收器负责过期数据的清理。

pub mod capacity;
pub mod event_pump;
pub mod gateway;
pub mod group;
pub mod manager;
pub mod reaper;
pub mod report_service;
pub mod retry;
pub mod scheduler;
pub mod service;

#[cfg(test)]
pub mod test_utils;

pub use capacity::CapacityMonitor;
pub use event_pump::EventPump;
pub use gateway::PersistenceGateway;
pub use group::{purge_group, GroupDeletion, GroupService};
pub use manager::{TaskManager, TickSummary, POD_SNAPSHOT};
pub use reaper::{ReapSummary, Reaper};
pub use report_service::ReportService;
pub use retry::with_retry;
pub use scheduler::{ClusterView, Decision, Scheduler, SchedulerConfig};
pub use service::{TaskDashboard, TaskService};
