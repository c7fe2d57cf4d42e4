//! 集成测试环境：临时 SQLite、文件与 bucket 目录、手动推进的模拟集群以及各服务

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use taskhub_core::backoff::RetryPolicy;
use taskhub_core::config::{
    BucketConfig, ClusterConfig, HubConfig, ManagerConfig, ReaperConfig, ReporterConfig,
    SimulationMode,
};
use taskhub_core::models::{AddonSpec, ExtensionSpec, KindSpec, NodeCapacity, Task};
use taskhub_dispatcher::{
    GroupService, PersistenceGateway, Reaper, ReportService, TaskManager, TaskService,
};
use taskhub_infrastructure::{BucketStore, Database, FileStore, MetricsCollector, SimulatedCluster};
use tempfile::TempDir;

/// 单节点、一个 addon、一个 extension、两个任务类型的集群
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

/// 快速调和、无退避的管理器配置
pub fn manager_config(max_running: u32) -> ManagerConfig {
    ManagerConfig {
        tick_interval_ms: 10,
        max_running,
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

pub struct TestHarness {
    pub dir: TempDir,
    pub db: Database,
    pub gateway: PersistenceGateway,
    pub cluster: Arc<SimulatedCluster>,
    pub files: FileStore,
    pub buckets: BucketStore,
    pub metrics: Arc<MetricsCollector>,
    pub hub: HubConfig,
    pub tasks: TaskService,
    pub groups: GroupService,
    pub reports: ReportService,
    pub manager: Arc<TaskManager>,
}

impl TestHarness {
    /// 节点容量为 10、最多运行 10 个任务的环境
    pub async fn new() -> Result<Self> {
        Self::with_config(cluster_config(10), manager_config(10)).await
    }

    pub async fn with_config(cluster: ClusterConfig, manager: ManagerConfig) -> Result<Self> {
        let dir = tempfile::tempdir().context("创建临时目录失败")?;
        let db = Database::open(&dir.path().join("hub.db"))
            .await
            .context("打开测试数据库失败")?;
        let hub = HubConfig::default();
        let gateway = PersistenceGateway::sqlite(db.clone());
        let cluster = Arc::new(SimulatedCluster::new(&hub.namespace, cluster));
        let files = FileStore::new(dir.path().join("file"));
        let buckets = BucketStore::new(dir.path().join("bucket"));
        let metrics = Arc::new(MetricsCollector::new()?);

        let tasks = TaskService::new(
            gateway.clone(),
            cluster.clone(),
            files.clone(),
            buckets.clone(),
            metrics.clone(),
        );
        let groups = GroupService::new(gateway.clone(), tasks.clone(), buckets.clone());
        let reports = ReportService::new(
            gateway.clone(),
            files.clone(),
            ReporterConfig::default(),
            metrics.clone(),
        );
        let manager = Arc::new(TaskManager::new(
            gateway.clone(),
            cluster.clone(),
            files.clone(),
            buckets.clone(),
            manager,
            hub.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            dir,
            db,
            gateway,
            cluster,
            files,
            buckets,
            metrics,
            hub,
            tasks,
            groups,
            reports,
            manager,
        })
    }

    pub fn reaper(&self, config: ReaperConfig, bucket: BucketConfig) -> Reaper {
        Reaper::new(
            self.gateway.clone(),
            self.cluster.clone(),
            self.files.clone(),
            self.buckets.clone(),
            config,
            bucket,
            self.metrics.clone(),
        )
    }

    /// 运行 n 个调和周期
    pub async fn ticks(&self, n: usize) -> Result<()> {
        for _ in 0..n {
            self.manager.tick().await?;
        }
        Ok(())
    }

    /// 绕过服务层直接写入任务
    pub async fn insert(&self, task: Task) -> Result<Task> {
        Ok(self.gateway.tasks.create(&task).await?)
    }

    pub async fn load(&self, id: i64) -> Result<Task> {
        self.gateway
            .tasks
            .get(id)
            .await?
            .with_context(|| format!("任务 {id} 不存在"))
    }
}
