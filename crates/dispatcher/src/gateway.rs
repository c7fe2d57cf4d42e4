//! 持久化网关：各实体仓储的集合

use std::sync::Arc;

use taskhub_core::traits::{
    BucketRepository, FileRepository, ReportRepository, TaskGroupRepository, TaskRepository,
};
use taskhub_infrastructure::{
    Database, SqliteBucketRepository, SqliteFileRepository, SqliteReportRepository,
    SqliteTaskGroupRepository, SqliteTaskRepository,
};

#[derive(Clone)]
pub struct PersistenceGateway {
    pub tasks: Arc<dyn TaskRepository>,
    pub reports: Arc<dyn ReportRepository>,
    pub groups: Arc<dyn TaskGroupRepository>,
    pub buckets: Arc<dyn BucketRepository>,
    pub files: Arc<dyn FileRepository>,
}

impl PersistenceGateway {
    /// 基于嵌入式 SQLite 的网关
    pub fn sqlite(db: Database) -> Self {
        Self {
            tasks: Arc::new(SqliteTaskRepository::new(db.clone())),
            reports: Arc::new(SqliteReportRepository::new(db.clone())),
            groups: Arc::new(SqliteTaskGroupRepository::new(db.clone())),
            buckets: Arc::new(SqliteBucketRepository::new(db.clone())),
            files: Arc::new(SqliteFileRepository::new(db)),
        }
    }
}
