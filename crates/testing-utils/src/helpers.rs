//! 测试辅助：条件等待与日志初始化

use std::time::Duration;

use tokio::time::sleep;

pub struct TestEnv;

impl TestEnv {
    /// 轮询等待条件成立，超时返回 false
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// 初始化测试日志（每个测试二进制调用一次即可）
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("taskhub=debug")
            .try_init();
    }
}

