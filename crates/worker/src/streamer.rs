//! 命令输出流式上传
//!
//! 子进程的 stdout/stderr 汇入同一个 Hub 文件，该文件在启动前附加到任务报告。
//! 有新输出时立即按最小间隔上传，空闲时间隔以加性方式增长到上限。

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use taskhub_core::backoff::AdditiveBackoff;
use taskhub_core::models::FileRecord;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::WorkerResult;
use crate::reporter::TaskReporter;

const CHUNK: usize = 8 * 1024;

pub struct OutputStreamer {
    reporter: TaskReporter,
    min: Duration,
    max: Duration,
}

impl OutputStreamer {
    pub fn new(reporter: TaskReporter) -> Self {
        Self {
            reporter,
            min: Duration::from_millis(100),
            max: Duration::from_secs(1),
        }
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min = min;
        self.max = max.max(min);
        self
    }

    /// 运行命令直到退出，输出写入名为 `name` 的文件
    ///
    /// 非零退出码以 Error 条目记入报告，退出状态原样返回。
    pub async fn run(&self, command: &mut Command, name: &str) -> WorkerResult<(ExitStatus, FileRecord)> {
        let client = self.reporter.client();
        let file = client.create_file(name, "text/plain", Vec::new()).await?;
        self.reporter.attach(&file).await?;

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx.clone()));
        }
        drop(tx);

        let mut backoff = AdditiveBackoff::new(self.min, self.max);
        let mut pending: Vec<u8> = Vec::new();
        let mut deadline = Instant::now() + backoff.current();
        loop {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(chunk) => pending.extend_from_slice(&chunk),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if pending.is_empty() {
                        backoff.idle();
                    } else {
                        client.append_file(file.id, std::mem::take(&mut pending)).await?;
                        backoff.reset();
                    }
                    deadline = Instant::now() + backoff.current();
                }
            }
        }
        if !pending.is_empty() {
            client.append_file(file.id, pending).await?;
        }

        let status = child.wait().await?;
        debug!(task.id = self.reporter.task_id(), file.id = file.id, %status, "命令已退出");
        if !status.success() {
            warn!(task.id = self.reporter.task_id(), %status, "命令执行失败: {}", name);
            self.reporter
                .error("Error", &format!("{name} 执行失败: {status}"))
                .await?;
        }
        Ok((status, file))
    }
}

async fn pump<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("读取命令输出失败: {}", e);
                break;
            }
        }
    }
}
