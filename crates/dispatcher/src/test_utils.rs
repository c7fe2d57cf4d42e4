//! 单元测试共用的夹具：临时 SQLite、文件与 bucket 目录、手动推进的模拟集群

use std::collections::BTreeMap;
use std::sync::Arc;

use taskhub_core::backoff::RetryPolicy;
use taskhub_core::config::{
    BucketConfig, ClusterConfig, HubConfig, ManagerConfig, ReaperConfig, ReporterConfig,
    SimulationMode,
};
use taskhub_core::models::{AddonSpec, ExtensionSpec, KindSpec, NodeCapacity, Task, TaskState};
use taskhub_infrastructure::{BucketStore, Database, FileStore, MetricsCollector, SimulatedCluster};
use tempfile::TempDir;

use crate::gateway::PersistenceGateway;
use crate::group::GroupService;
use crate::manager::TaskManager;
use crate::reaper::Reaper;
use crate::report_service::ReportService;
use crate::service::TaskService;

pub struct Fixture {
    pub dir: TempDir,
    pub gateway: PersistenceGateway,
    pub cluster: Arc<SimulatedCluster>,
    pub files: FileStore,
    pub buckets: BucketStore,
    pub metrics: Arc<MetricsCollector>,
    pub hub: HubConfig,
}

pub fn manager_config() -> ManagerConfig {
    ManagerConfig {
        tick_interval_ms: 10,
        max_running: 10,
        preemption_enabled: true,
        unschedulable_backoff_seconds: 0,
        retry: RetryPolicy {
            max_attempts: 3,
            base_interval_ms: 1,
            max_interval_ms: 2,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn cluster_config(capacity: u32) -> ClusterConfig {
    ClusterConfig {
        mode: SimulationMode::Manual,
        nodes: vec![NodeCapacity {
            name: "node-1".into(),
            capacity,
        }],
        addons: vec![AddonSpec {
            name: "analyzer".into(),
            image: "quay.io/taskhub/analyzer:latest".into(),
            tasks: vec!["analyze*".into()],
            env: BTreeMap::from([("LOG_LEVEL".to_string(), "info".to_string())]),
        }],
        extensions: vec![ExtensionSpec {
            name: "java-provider".into(),
            image: "quay.io/taskhub/java:latest".into(),
            addon: "analyzer".into(),
            env: BTreeMap::from([("PORT".to_string(), "8000".to_string())]),
            tasks: Vec::new(),
        }],
        kinds: vec![
            KindSpec {
                name: "analyze".into(),
                priority: 10,
                dependencies: vec!["analyze-discovery".into()],
                ..Default::default()
            },
            KindSpec {
                name: "analyze-discovery".into(),
                priority: 5,
                ..Default::default()
            },
        ],
        pending_ms: 0,
        running_ms: 0,
        failure_rate: 0.0,
    }
}

impl Fixture {
    pub async fn new(capacity: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("hub.db")).await.unwrap();
        let hub = HubConfig::default();
        Self {
            gateway: PersistenceGateway::sqlite(db),
            cluster: Arc::new(SimulatedCluster::new(&hub.namespace, cluster_config(capacity))),
            files: FileStore::new(dir.path().join("file")),
            buckets: BucketStore::new(dir.path().join("bucket")),
            metrics: Arc::new(MetricsCollector::new().unwrap()),
            hub,
            dir,
        }
    }

    pub fn manager(&self, config: ManagerConfig) -> TaskManager {
        TaskManager::new(
            self.gateway.clone(),
            self.cluster.clone(),
            self.files.clone(),
            self.buckets.clone(),
            config,
            self.hub.clone(),
            self.metrics.clone(),
        )
    }

    pub fn tasks(&self) -> TaskService {
        TaskService::new(
            self.gateway.clone(),
            self.cluster.clone(),
            self.files.clone(),
            self.buckets.clone(),
            self.metrics.clone(),
        )
    }

    pub fn groups(&self) -> GroupService {
        GroupService::new(self.gateway.clone(), self.tasks(), self.buckets.clone())
    }

    pub fn reports(&self) -> ReportService {
        ReportService::new(
            self.gateway.clone(),
            self.files.clone(),
            ReporterConfig::default(),
            self.metrics.clone(),
        )
    }

    pub fn reaper(&self, config: ReaperConfig) -> Reaper {
        Reaper::new(
            self.gateway.clone(),
            self.cluster.clone(),
            self.files.clone(),
            self.buckets.clone(),
            config,
            BucketConfig::default(),
            self.metrics.clone(),
        )
    }

    /// 直接写入一个任务（绕过服务层校验）
    pub async fn insert(&self, mut task: Task) -> Task {
        if task.addon.is_empty() && task.kind.is_empty() {
            task.addon = "analyzer".into();
        }
        self.gateway.tasks.create(&task).await.unwrap()
    }

    pub async fn ready(&self, name: &str, priority: i32) -> Task {
        let mut task = Task::new(name);
        task.addon = "analyzer".into();
        task.extensions = vec!["java-provider".into()];
        task.priority = priority;
        task.state = TaskState::Ready;
        self.insert(task).await
    }

    pub async fn load(&self, id: i64) -> Task {
        self.gateway.tasks.get(id).await.unwrap().unwrap()
    }
}
