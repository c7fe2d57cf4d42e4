pub mod bucket;
pub mod cluster;
pub mod data;
pub mod file;
pub mod group;
pub mod query;
pub mod report;
pub mod task;

pub use bucket::Bucket;
pub use cluster::{
    glob_match, AddonSpec, ContainerSpec, ContainerState, ExtensionSpec, FailureReason, KindSpec,
    NodeCapacity, PodEvent, PodEventBatch, PodEventKind, PodRef, PodSpec, PodState, PodStatus,
};
pub use file::FileRecord;
pub use group::{GroupMode, TaskGroup};
pub use query::{FilterOp, ListQuery, Page, Predicate, QueueReport};
pub use report::{ReportOp, ReportStatus, TaskReport};
pub use task::{event, Attachment, Ref, Task, TaskError, TaskEvent, TaskPolicy, TaskState, Ttl};
