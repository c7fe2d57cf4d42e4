pub mod sequence;
pub mod sqlite_bucket_repository;
pub mod sqlite_file_repository;
pub mod sqlite_group_repository;
pub mod sqlite_report_repository;
pub mod sqlite_task_repository;

pub use sqlite_bucket_repository::SqliteBucketRepository;
pub use sqlite_file_repository::SqliteFileRepository;
pub use sqlite_group_repository::SqliteTaskGroupRepository;
pub use sqlite_report_repository::SqliteReportRepository;
pub use sqlite_task_repository::SqliteTaskRepository;
