use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use clap::ValueEnum;
use metrics_exporter_prometheus::PrometheusHandle;
use taskhub_api::{create_app, AppState};
use taskhub_core::AppConfig;
use taskhub_dispatcher::{
    EventPump, GroupService, PersistenceGateway, Reaper, ReportService, TaskManager, TaskService,
};
use taskhub_infrastructure::{BucketStore, Database, FileStore, MetricsCollector, SimulatedCluster};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Pod 事件通道容量
const EVENT_BUFFER: usize = 1024;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AppMode {
    /// 仅运行 REST 服务与上报刷新
    Api,
    /// 仅运行任务管理器、事件泵与回收器
    Manager,
    /// 运行所有组件
    All,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    db: Database,
    gateway: PersistenceGateway,
    cluster: Arc<SimulatedCluster>,
    files: FileStore,
    buckets: BucketStore,
    metrics: Arc<MetricsCollector>,
    tasks: TaskService,
    groups: GroupService,
    reports: ReportService,
    prometheus: Option<PrometheusHandle>,
}

impl Application {
    pub async fn new(
        config: AppConfig,
        mode: AppMode,
        prometheus: Option<PrometheusHandle>,
    ) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let db = Database::connect(&config.database)
            .await
            .context("连接数据库失败")?;
        let gateway = PersistenceGateway::sqlite(db.clone());
        let cluster = Arc::new(SimulatedCluster::new(
            config.hub.namespace.clone(),
            config.cluster.clone(),
        ));
        let files = FileStore::new(&config.file.root);
        let buckets = BucketStore::new(&config.bucket.root);
        let metrics = Arc::new(MetricsCollector::new().context("创建指标收集器失败")?);

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
            config.reporter.clone(),
            metrics.clone(),
        );

        Ok(Self {
            config,
            mode,
            db,
            gateway,
            cluster,
            files,
            buckets,
            metrics,
            tasks,
            groups,
            reports,
            prometheus,
        })
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    /// 组装 REST 路由（含中间件）
    pub fn router(&self) -> Router {
        let state = AppState {
            db: self.db.clone(),
            gateway: self.gateway.clone(),
            tasks: self.tasks.clone(),
            groups: self.groups.clone(),
            reports: self.reports.clone(),
            files: self.files.clone(),
            buckets: self.buckets.clone(),
            hub: self.config.hub.clone(),
            metrics_endpoint: self.config.observability.metrics_endpoint.clone(),
            prometheus: self
                .prometheus
                .clone()
                .filter(|_| self.config.observability.metrics_enabled),
        };
        create_app(state, &self.config.api)
    }

    /// 运行直到收到关闭信号且所有组件退出
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);
        let mut handles = Vec::new();

        if matches!(self.mode, AppMode::Manager | AppMode::All) {
            handles.extend(self.spawn_manager(&shutdown));
        }
        if matches!(self.mode, AppMode::Api | AppMode::All) {
            if self.config.api.enabled {
                handles.push(self.spawn_reporter(&shutdown));
                handles.push(self.spawn_api(&shutdown).await?);
            } else {
                info!("API 已在配置中禁用");
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("组件异常退出: {}", e);
            }
        }
        self.db.close().await;
        info!("所有组件已停止");
        Ok(())
    }

    fn spawn_manager(&self, shutdown: &broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
        let manager = Arc::new(
            TaskManager::new(
                self.gateway.clone(),
                self.cluster.clone(),
                self.files.clone(),
                self.buckets.clone(),
                self.config.manager.clone(),
                self.config.hub.clone(),
                self.metrics.clone(),
            )
            .with_events(receiver),
        );
        let pump = EventPump::new(
            self.cluster.clone(),
            sender,
            Duration::from_millis(self.config.manager.event_pump_interval_ms),
        );
        let reaper = Arc::new(Reaper::new(
            self.gateway.clone(),
            self.cluster.clone(),
            self.files.clone(),
            self.buckets.clone(),
            self.config.reaper.clone(),
            self.config.bucket.clone(),
            self.metrics.clone(),
        ));

        vec![
            tokio::spawn(manager.run(shutdown.resubscribe())),
            tokio::spawn(pump.run(shutdown.resubscribe())),
            tokio::spawn(reaper.run(shutdown.resubscribe())),
        ]
    }

    fn spawn_reporter(&self, shutdown: &broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.reports.clone().run(shutdown.resubscribe()))
    }

    async fn spawn_api(&self, shutdown: &broadcast::Receiver<()>) -> Result<JoinHandle<()>> {
        let address = self.config.api.bind_address.clone();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("绑定地址失败: {address}"))?;
        info!("API服务器启动在 http://{}", address);

        let app = self.router();
        let mut shutdown = shutdown.resubscribe();
        Ok(tokio::spawn(async move {
            let graceful = async move {
                let _ = shutdown.recv().await;
                info!("API服务器收到关闭信号");
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("API服务器运行失败: {}", e);
            }
        }))
    }
}
