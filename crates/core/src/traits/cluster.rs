use async_trait::async_trait;

use crate::errors::HubResult;
use crate::models::{
    AddonSpec, ExtensionSpec, KindSpec, NodeCapacity, PodEvent, PodEventBatch, PodRef, PodSpec,
    PodState,
};

/// 集群驱动
///
/// 所有集群侧副作用的唯一出口。实现必须保证：
/// - 查找失败返回 `AddonNotFound`/`ExtensionNotFound`/`KindNotFound`
/// - 删除不存在的 Pod 返回 `Ok(false)` 而不是错误
/// - 瞬时故障返回 `HubError::Cluster`，由调用方退避重试
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    async fn lookup_addon(&self, name: &str) -> HubResult<AddonSpec>;

    async fn lookup_extension(&self, name: &str) -> HubResult<ExtensionSpec>;

    async fn lookup_kind(&self, name: &str) -> HubResult<KindSpec>;

    async fn addons(&self) -> HubResult<Vec<AddonSpec>>;

    async fn extensions(&self) -> HubResult<Vec<ExtensionSpec>>;

    async fn kinds(&self) -> HubResult<Vec<KindSpec>>;

    async fn nodes(&self) -> HubResult<Vec<NodeCapacity>>;

    async fn create_pod(&self, spec: &PodSpec) -> HubResult<PodRef>;

    /// Pod 不存在时返回 `None`
    async fn get_pod(&self, pod: &PodRef) -> HubResult<Option<PodState>>;

    async fn delete_pod(&self, pod: &PodRef) -> HubResult<bool>;

    async fn list_pods(&self) -> HubResult<Vec<PodState>>;

    async fn pod_log(&self, pod: &PodRef, container: &str) -> HubResult<String>;

    /// 终止单个容器（用于主容器结束后仍在运行的 extension 容器）
    async fn kill_container(&self, pod: &PodRef, container: &str) -> HubResult<()>;

    /// 从 `resume` 之后读取一批事件，返回的 `resume` 用于下一次读取
    async fn pod_events(&self, resume: u64) -> HubResult<PodEventBatch>;

    /// 单个 Pod 的事件历史
    async fn pod_history(&self, pod: &PodRef) -> HubResult<Vec<PodEvent>>;
}
