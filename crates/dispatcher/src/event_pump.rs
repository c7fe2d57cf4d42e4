//! Pod 事件泵：按续读令牌轮询集群事件流并转发给任务管理器

use std::sync::Arc;
use std::time::Duration;

use taskhub_core::models::PodEvent;
use taskhub_core::traits::ClusterDriver;
use taskhub_core::HubResult;
use taskhub_infrastructure::StructuredLogger;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

pub struct EventPump {
    cluster: Arc<dyn ClusterDriver>,
    sender: mpsc::Sender<PodEvent>,
    resume: u64,
    interval: Duration,
}

impl EventPump {
    pub fn new(
        cluster: Arc<dyn ClusterDriver>,
        sender: mpsc::Sender<PodEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            cluster,
            sender,
            resume: 0,
            interval,
        }
    }

    pub fn resume(&self) -> u64 {
        self.resume
    }

    /// 拉取一批事件，返回转发的数量
    ///
    /// 接收端关闭时停止转发，但续读令牌仍然前移。
    pub async fn poll_once(&mut self) -> HubResult<usize> {
        let batch = self.cluster.pod_events(self.resume).await?;
        let mut forwarded = 0;
        for event in batch.events {
            if self.sender.send(event).await.is_err() {
                debug!("事件接收端已关闭");
                break;
            }
            forwarded += 1;
        }
        self.resume = batch.resume.max(self.resume);
        Ok(forwarded)
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("启动Pod事件泵，间隔 {}ms", self.interval.as_millis());
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        StructuredLogger::log_system_error("event_pump", "poll", &e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Pod事件泵收到关闭信号");
                    break;
                }
            }
        }
    }
}
