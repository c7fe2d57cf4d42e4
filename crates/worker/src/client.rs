//! Hub REST 客户端

use reqwest::{header, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use taskhub_core::models::{FileRecord, Task, TaskReport};
use tracing::{debug, error, warn};

use crate::env::AddonEnv;
use crate::error::{WorkerError, WorkerResult};

#[derive(Debug, Clone)]
pub struct HubClient {
    base_url: String,
    token: String,
    http_client: reqwest::Client,
}

impl HubClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn from_env(env: &AddonEnv) -> Self {
        Self::new(env.hub_url.clone(), env.token.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http_client
            .request(method, format!("{}{}", self.base_url, path));
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }

    async fn send(&self, builder: RequestBuilder) -> WorkerResult<Response> {
        let response = builder.send().await.map_err(|e| {
            error!("连接 Hub 失败: {}", e);
            WorkerError::Http(e)
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        warn!(%url, status = status.as_u16(), "Hub 请求失败: {}", body);
        Err(WorkerError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> WorkerResult<T> {
        let response = self.send(builder).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn get_task(&self, id: i64) -> WorkerResult<Task> {
        self.json(self.request(Method::GET, &format!("/tasks/{id}")))
            .await
    }

    pub async fn get_report(&self, task: i64) -> WorkerResult<TaskReport> {
        self.json(self.request(Method::GET, &format!("/tasks/{task}/report")))
            .await
    }

    /// `PUT /tasks/{id}/report/{action}`
    pub async fn report(&self, task: i64, action: &str, body: Option<Value>) -> WorkerResult<()> {
        let mut builder = self.request(Method::PUT, &format!("/tasks/{task}/report/{action}"));
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        self.send(builder).await?;
        debug!(task.id = task, action, "上报完成");
        Ok(())
    }

    pub async fn create_file(
        &self,
        name: &str,
        encoding: &str,
        content: Vec<u8>,
    ) -> WorkerResult<FileRecord> {
        let builder = self
            .request(Method::POST, &format!("/files/{name}"))
            .header(header::CONTENT_TYPE, encoding)
            .body(content);
        self.json(builder).await
    }

    pub async fn append_file(&self, id: i64, content: Vec<u8>) -> WorkerResult<()> {
        let builder = self
            .request(Method::PUT, &format!("/files/{id}"))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(content);
        self.send(builder).await?;
        Ok(())
    }

    pub async fn get_file(&self, id: i64) -> WorkerResult<Vec<u8>> {
        let response = self
            .send(self.request(Method::GET, &format!("/files/{id}")))
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// 写入任务 bucket 中的单个文件
    pub async fn put_bucket_file(&self, task: i64, path: &str, content: Vec<u8>) -> WorkerResult<()> {
        let builder = self
            .request(Method::PUT, &bucket_path(task, path))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(content);
        self.send(builder).await?;
        Ok(())
    }

    /// 读取任务 bucket 内容，目录返回 gzip TAR
    pub async fn get_bucket(&self, task: i64, path: &str) -> WorkerResult<Vec<u8>> {
        let response = self
            .send(self.request(Method::GET, &bucket_path(task, path)))
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn delete_bucket(&self, task: i64, path: &str) -> WorkerResult<()> {
        self.send(self.request(Method::DELETE, &bucket_path(task, path)))
            .await?;
        Ok(())
    }
}

fn bucket_path(task: i64, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        format!("/tasks/{task}/bucket")
    } else {
        format!("/tasks/{task}/bucket/{path}")
    }
}
