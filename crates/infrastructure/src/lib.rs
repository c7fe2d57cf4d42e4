pub mod bucket_store;
pub mod cluster;
pub mod database;
pub mod file_store;
pub mod observability;

pub use bucket_store::{BucketEntry, BucketStore};
pub use cluster::SimulatedCluster;
pub use database::*;
pub use file_store::FileStore;
pub use observability::*;
