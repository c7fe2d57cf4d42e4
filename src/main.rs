use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use taskhub::shutdown::{wait_for_signal, ShutdownManager};
use taskhub::{AppMode, Application};
use taskhub_core::config::ObservabilityConfig;
use taskhub_core::AppConfig;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 关闭时等待各组件退出的上限
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "taskhub", version, about = "任务编排核心")]
struct Cli {
    /// 配置文件路径，缺省时依次查找 config/taskhub.toml、taskhub.toml
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// 运行模式
    #[arg(short, long, value_enum, default_value_t = AppMode::All)]
    mode: AppMode,

    /// 覆盖配置中的日志级别
    #[arg(short = 'l', long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// 覆盖配置中的日志格式
    #[arg(long, value_name = "FORMAT", value_parser = ["json", "pretty"])]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            cli.config.as_deref().unwrap_or("<默认路径>")
        )
    })?;
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.observability.log_format = format;
    }

    init_logging(&config.observability)?;
    info!("启动 taskhub，模式: {:?}", cli.mode);

    let prometheus = init_metrics(&config.observability)?;
    let app = Application::new(config, cli.mode, prometheus).await?;

    let shutdown = ShutdownManager::new();
    let receiver = shutdown.subscribe();
    let handle = tokio::spawn(async move {
        if let Err(e) = app.run(receiver).await {
            error!("应用运行失败: {e:#}");
        }
    });

    wait_for_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown.shutdown();

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }
    Ok(())
}

/// 初始化日志，`RUST_LOG` 优先于配置
fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        other => return Err(anyhow::anyhow!("不支持的日志格式: {other}")),
    }
    Ok(())
}

fn init_metrics(config: &ObservabilityConfig) -> Result<Option<PrometheusHandle>> {
    if !config.metrics_enabled {
        return Ok(None);
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("安装Prometheus指标记录器失败")?;
    Ok(Some(handle))
}
