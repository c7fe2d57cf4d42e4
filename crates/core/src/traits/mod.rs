pub mod cluster;
pub mod repository;

pub use cluster::ClusterDriver;
pub use repository::{
    BucketRepository, FileRepository, ReportRepository, TaskGroupRepository, TaskRepository,
};
