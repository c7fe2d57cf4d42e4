//! 可观测性：结构化日志与指标

pub mod metrics_collector;
pub mod structured_logger;

pub use metrics_collector::MetricsCollector;
pub use structured_logger::StructuredLogger;
