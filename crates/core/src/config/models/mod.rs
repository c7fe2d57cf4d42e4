pub mod api_observability;
pub mod app_config;
pub mod cluster;
pub mod database;
pub mod manager;
pub mod storage;

pub use api_observability::{ApiConfig, ObservabilityConfig};
pub use app_config::AppConfig;
pub use cluster::{ClusterConfig, SimulationMode};
pub use database::DatabaseConfig;
pub use manager::{HubConfig, ManagerConfig, ReaperConfig, ReporterConfig};
pub use storage::{BucketConfig, FileConfig};
