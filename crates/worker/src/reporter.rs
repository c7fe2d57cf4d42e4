//! 任务进度上报
//!
//! 每个方法对应一个上报操作，`run` 负责 started/succeeded/failed 的收尾。

use std::future::Future;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use taskhub_core::models::{FileRecord, Task};
use tracing::{error, info};

use crate::client::HubClient;
use crate::env::AddonEnv;
use crate::error::WorkerResult;

#[derive(Debug, Clone)]
pub struct TaskReporter {
    client: HubClient,
    task: i64,
}

impl TaskReporter {
    pub fn new(client: HubClient, task: i64) -> Self {
        Self { client, task }
    }

    pub fn from_env(env: &AddonEnv) -> Self {
        Self::new(HubClient::from_env(env), env.task)
    }

    pub fn task_id(&self) -> i64 {
        self.task
    }

    pub fn client(&self) -> &HubClient {
        &self.client
    }

    pub async fn task(&self) -> WorkerResult<Task> {
        self.client.get_task(self.task).await
    }

    /// 将任务数据解析为 addon 自己的结构
    pub async fn data<T: DeserializeOwned>(&self) -> WorkerResult<T> {
        let task = self.task().await?;
        Ok(serde_json::from_value(task.data)?)
    }

    /// 以 started 开始执行，闭包返回错误时上报 failed，否则上报 succeeded
    pub async fn run<F, Fut>(&self, f: F) -> WorkerResult<()>
    where
        F: FnOnce(TaskReporter) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.started().await?;
        match f(self.clone()).await {
            Ok(()) => self.succeeded().await,
            Err(e) => {
                error!(task.id = self.task, "addon 执行失败: {:#}", e);
                self.failed(&format!("{e:#}")).await
            }
        }
    }

    pub async fn started(&self) -> WorkerResult<()> {
        info!(task.id = self.task, "addon 开始执行");
        self.client.report(self.task, "started", None).await
    }

    pub async fn activity(&self, entry: impl Into<String>) -> WorkerResult<()> {
        let entry = entry.into();
        info!(task.id = self.task, "{}", entry);
        self.client
            .report(self.task, "activity", Some(json!({ "entries": [entry] })))
            .await
    }

    pub async fn total(&self, total: i64) -> WorkerResult<()> {
        self.client
            .report(self.task, "total", Some(json!({ "total": total })))
            .await
    }

    pub async fn completed(&self, completed: i64) -> WorkerResult<()> {
        self.client
            .report(self.task, "completed", Some(json!({ "completed": completed })))
            .await
    }

    pub async fn increment(&self) -> WorkerResult<()> {
        self.client.report(self.task, "increment", None).await
    }

    pub async fn error(&self, severity: &str, description: &str) -> WorkerResult<()> {
        self.client
            .report(
                self.task,
                "error",
                Some(json!({ "severity": severity, "description": description })),
            )
            .await
    }

    pub async fn failed(&self, reason: &str) -> WorkerResult<()> {
        self.client
            .report(self.task, "failed", Some(json!({ "reason": reason })))
            .await
    }

    /// 附加文件，位置为当前 activity 末尾
    pub async fn attach(&self, file: &FileRecord) -> WorkerResult<()> {
        self.client
            .report(
                self.task,
                "attach",
                Some(json!({ "fileId": file.id, "name": file.name })),
            )
            .await
    }

    pub async fn attach_at(&self, file: &FileRecord, activity: usize) -> WorkerResult<()> {
        self.client
            .report(
                self.task,
                "attach",
                Some(json!({ "fileId": file.id, "name": file.name, "activity": activity })),
            )
            .await
    }

    pub async fn result(&self, result: Value) -> WorkerResult<()> {
        self.client
            .report(self.task, "result", Some(json!({ "result": result })))
            .await
    }

    pub async fn succeeded(&self) -> WorkerResult<()> {
        info!(task.id = self.task, "addon 执行成功");
        self.client.report(self.task, "succeeded", None).await
    }
}
