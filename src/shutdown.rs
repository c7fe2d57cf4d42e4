use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// 优雅关闭管理器
///
/// 各后台循环通过 [`ShutdownManager::subscribe`] 获得接收端，
/// 触发后所有接收端收到一次信号；关闭后订阅的接收端立即就绪。
#[derive(Clone)]
pub struct ShutdownManager {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        if self.is_shutdown() {
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            return rx;
        }
        self.sender.subscribe()
    }

    /// 触发关闭，重复调用无效果
    pub fn shutdown(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            debug!("关闭信号已经发送过");
            return;
        }
        let receivers = self.sender.send(()).unwrap_or(0);
        info!("关闭信号已发送给 {} 个订阅者", receivers);
    }

    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("安装Ctrl+C信号处理器失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("安装SIGTERM信号处理器失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_all_subscribers_notified() {
        let manager = ShutdownManager::new();
        let mut rx1 = manager.subscribe();
        let mut rx2 = manager.clone().subscribe();
        assert!(!manager.is_shutdown());

        manager.shutdown();
        assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_ok());
        assert!(timeout(Duration::from_millis(100), rx2.recv()).await.is_ok());
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown() {
        let manager = ShutdownManager::new();
        manager.shutdown();
        manager.shutdown();

        let mut rx = manager.subscribe();
        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
