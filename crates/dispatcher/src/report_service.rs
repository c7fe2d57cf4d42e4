//! 服务端的上报协议
//!
//! 每个任务的报告由 addon 通过 [`ReportOp`] 增量更新。activity 行先进入按任务的
//! 缓冲区，按节流间隔批量写入；间隔在写入失败时倍增、成功时线性回落，
//! 始终位于 `[min_backoff, max_backoff]`。任何非 activity 操作先刷新缓冲区。
//! 报告进入终态或缓冲区空闲超过 `max_backoff` 后，任务的节流状态被回收。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use taskhub_core::backoff::AimdBackoff;
use taskhub_core::config::ReporterConfig;
use taskhub_core::models::{ReportOp, ReportStatus, TaskReport};
use taskhub_core::{HubError, HubResult};
use taskhub_infrastructure::{FileStore, MetricsCollector, StructuredLogger};
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::gateway::PersistenceGateway;

/// 单个任务的 activity 缓冲与节流状态
struct Throttle {
    pending: Vec<String>,
    last_flush: Instant,
    backoff: AimdBackoff,
    /// 已从表中移除，持有旧句柄的调用方需要重新获取
    retired: bool,
}

impl Throttle {
    fn due(&self) -> bool {
        self.last_flush.elapsed() >= self.backoff.current()
    }
}

type Slot = Arc<tokio::sync::Mutex<Throttle>>;

#[derive(Clone)]
pub struct ReportService {
    gateway: PersistenceGateway,
    files: FileStore,
    config: ReporterConfig,
    slots: Arc<Mutex<HashMap<i64, Slot>>>,
    metrics: Arc<MetricsCollector>,
}

impl ReportService {
    pub fn new(
        gateway: PersistenceGateway,
        files: FileStore,
        config: ReporterConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            gateway,
            files,
            config,
            slots: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        }
    }

    /// 应用一个上报操作
    #[instrument(skip(self, op), fields(op = op.name()))]
    pub async fn apply(&self, task_id: i64, op: ReportOp) -> HubResult<()> {
        self.ensure_task(task_id).await?;
        if let ReportOp::Attach { file_id, .. } = &op {
            if self.gateway.files.get(*file_id).await?.is_none() {
                return Err(HubError::not_found("File", file_id));
            }
        }

        let (slot, mut throttle) = self.acquire(task_id).await?;
        let name = op.name();
        if let ReportOp::Activity { entries } = op {
            throttle.pending.extend(entries);
            if throttle.due() {
                self.flush(task_id, &mut throttle).await?;
            }
            return Ok(());
        }

        self.flush(task_id, &mut throttle).await?;
        let mut report = self.load_or_new(task_id).await?;
        report.apply(op)?;
        self.gateway.reports.save(&report).await?;
        if report.status != ReportStatus::Running {
            self.retire(task_id, &slot, &mut throttle)?;
        }
        StructuredLogger::log_report_op(task_id, name, report.generation);
        self.metrics.record_report();
        Ok(())
    }

    /// 读取报告，先刷新尚未写入的 activity
    pub async fn get(&self, task_id: i64) -> HubResult<TaskReport> {
        self.ensure_task(task_id).await?;
        if let Some(slot) = self.existing(task_id)? {
            let mut throttle = slot.lock().await;
            self.flush(task_id, &mut throttle).await?;
        }
        self.gateway
            .reports
            .get(task_id)
            .await?
            .ok_or_else(|| HubError::not_found("TaskReport", task_id))
    }

    /// 创建报告，已存在时冲突
    pub async fn create(&self, task_id: i64, mut report: TaskReport) -> HubResult<TaskReport> {
        self.ensure_task(task_id).await?;
        if self.gateway.reports.get(task_id).await?.is_some() {
            return Err(HubError::Conflict(format!("任务 {task_id} 的报告已存在")));
        }
        self.drop_slot(task_id)?;
        report.task_id = task_id;
        report.update_time = chrono::Utc::now();
        self.gateway.reports.save(&report).await?;
        self.metrics.record_report();
        Ok(report)
    }

    /// 整体替换报告
    pub async fn replace(&self, task_id: i64, mut report: TaskReport) -> HubResult<TaskReport> {
        self.ensure_task(task_id).await?;
        if self.gateway.reports.get(task_id).await?.is_none() {
            return Err(HubError::not_found("TaskReport", task_id));
        }
        self.drop_slot(task_id)?;
        report.task_id = task_id;
        report.update_time = chrono::Utc::now();
        self.gateway.reports.save(&report).await?;
        self.metrics.record_report();
        Ok(report)
    }

    pub async fn delete(&self, task_id: i64) -> HubResult<()> {
        self.ensure_task(task_id).await?;
        self.drop_slot(task_id)?;
        self.gateway.reports.delete(task_id).await?;
        Ok(())
    }

    /// 刷新所有到期的缓冲区，返回写入的行数
    pub async fn flush_due(&self) -> usize {
        let slots: Vec<(i64, Slot)> = match self.slots.lock() {
            Ok(slots) => slots.iter().map(|(id, s)| (*id, s.clone())).collect(),
            Err(_) => return 0,
        };
        let idle = Duration::from_millis(self.config.max_backoff_ms);
        let mut flushed = 0;
        for (task_id, slot) in slots {
            let mut throttle = slot.lock().await;
            if throttle.pending.is_empty() {
                if throttle.last_flush.elapsed() >= idle {
                    if let Err(e) = self.retire(task_id, &slot, &mut throttle) {
                        warn!("回收任务 {} 的上报缓冲失败: {}", task_id, e);
                    }
                }
                continue;
            }
            if !throttle.due() {
                continue;
            }
            let lines = throttle.pending.len();
            match self.flush(task_id, &mut throttle).await {
                Ok(()) => flushed += lines,
                Err(e) if e.is_not_found() => {
                    debug!("任务 {} 已删除，丢弃缓冲的 activity", task_id);
                    throttle.pending.clear();
                }
                Err(e) => warn!("刷新任务 {} 的 activity 失败: {}", task_id, e),
            }
        }
        flushed
    }

    /// 周期性刷新缓冲区，关闭时写出剩余的行
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_millis(self.config.min_backoff_ms);
        info!("启动上报刷新循环，间隔 {}ms", interval.as_millis());
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_due().await;
                }
                _ = shutdown.recv() => {
                    self.flush_all().await;
                    info!("上报刷新循环收到关闭信号");
                    break;
                }
            }
        }
    }

    async fn flush_all(&self) {
        let slots: Vec<(i64, Slot)> = match self.slots.lock() {
            Ok(slots) => slots.iter().map(|(id, s)| (*id, s.clone())).collect(),
            Err(_) => return,
        };
        for (task_id, slot) in slots {
            let mut throttle = slot.lock().await;
            if let Err(e) = self.flush(task_id, &mut throttle).await {
                warn!("关闭时刷新任务 {} 的 activity 失败: {}", task_id, e);
            }
        }
    }

    async fn flush(&self, task_id: i64, throttle: &mut Throttle) -> HubResult<()> {
        if throttle.pending.is_empty() {
            return Ok(());
        }
        let entries = std::mem::take(&mut throttle.pending);
        let result = async {
            let mut report = self.load_or_new(task_id).await?;
            report.apply(ReportOp::Activity {
                entries: entries.clone(),
            })?;
            self.gateway.reports.save(&report).await
        }
        .await;
        throttle.last_flush = Instant::now();
        match result {
            Ok(()) => {
                let next = throttle.backoff.success();
                debug!("任务 {} 写入 {} 行 activity，下次间隔 {}ms", task_id, entries.len(), next.as_millis());
                Ok(())
            }
            Err(e) => {
                if e.is_retryable() {
                    let next = throttle.backoff.pressure();
                    warn!("任务 {} 写入 activity 受阻，间隔增至 {}ms", task_id, next.as_millis());
                }
                let mut restored = entries;
                restored.append(&mut throttle.pending);
                throttle.pending = restored;
                Err(e)
            }
        }
    }

    async fn load_or_new(&self, task_id: i64) -> HubResult<TaskReport> {
        Ok(self
            .gateway
            .reports
            .get(task_id)
            .await?
            .unwrap_or_else(|| TaskReport::new(task_id)))
    }

    async fn ensure_task(&self, task_id: i64) -> HubResult<()> {
        match self.gateway.tasks.get(task_id).await? {
            Some(_) => Ok(()),
            None => {
                self.drop_slot(task_id)?;
                Err(HubError::not_found("Task", task_id))
            }
        }
    }

    fn slots(&self) -> HubResult<MutexGuard<'_, HashMap<i64, Slot>>> {
        self.slots
            .lock()
            .map_err(|_| HubError::Internal("上报缓冲锁已损坏".into()))
    }

    fn existing(&self, task_id: i64) -> HubResult<Option<Slot>> {
        Ok(self.slots()?.get(&task_id).cloned())
    }

    /// 锁定任务的节流状态，跳过已回收的旧句柄
    async fn acquire(&self, task_id: i64) -> HubResult<(Slot, OwnedMutexGuard<Throttle>)> {
        loop {
            let slot = self.slot(task_id)?;
            let throttle = slot.clone().lock_owned().await;
            if !throttle.retired {
                return Ok((slot, throttle));
            }
        }
    }

    /// 调用方须持有 `throttle` 的锁且缓冲区已清空
    fn retire(&self, task_id: i64, slot: &Slot, throttle: &mut Throttle) -> HubResult<()> {
        throttle.retired = true;
        let mut slots = self.slots()?;
        if slots.get(&task_id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&task_id);
        }
        Ok(())
    }

    fn slot(&self, task_id: i64) -> HubResult<Slot> {
        let mut slots = self.slots()?;
        let min = Duration::from_millis(self.config.min_backoff_ms);
        let max = Duration::from_millis(self.config.max_backoff_ms);
        Ok(slots
            .entry(task_id)
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(Throttle {
                    pending: Vec::new(),
                    last_flush: Instant::now(),
                    backoff: AimdBackoff::new(min, max),
                    retired: false,
                }))
            })
            .clone())
    }

    fn drop_slot(&self, task_id: i64) -> HubResult<()> {
        self.slots()?.remove(&task_id);
        Ok(())
    }

    /// 附件所在的文件存储
    pub fn files(&self) -> &FileStore {
        &self.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Fixture;
    use serde_json::json;

    fn activity(lines: &[&str]) -> ReportOp {
        ReportOp::Activity {
            entries: lines.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_started_then_progress() {
        let fx = Fixture::new(10).await;
        let task = fx.ready("r", 20).await;
        let reports = fx.reports();

        reports.apply(task.id, ReportOp::Started).await.unwrap();
        reports.apply(task.id, ReportOp::Total { total: 3 }).await.unwrap();
        reports.apply(task.id, ReportOp::Increment).await.unwrap();
        reports
            .apply(task.id, ReportOp::Completed { completed: 1 })
            .await
            .unwrap();
        let report = reports.get(task.id).await.unwrap();
        assert_eq!(report.generation, 1);
        assert_eq!(report.completed, 1);

        reports.apply(task.id, ReportOp::Succeeded).await.unwrap();
        reports.apply(task.id, ReportOp::Succeeded).await.unwrap();
        let report = reports.get(task.id).await.unwrap();
        assert_eq!(report.status, ReportStatus::Succeeded);
        assert_eq!(report.completed, 3);

        reports.apply(task.id, ReportOp::Started).await.unwrap();
        let report = reports.get(task.id).await.unwrap();
        assert_eq!(report.generation, 2);
        assert_eq!(report.status, ReportStatus::Running);
        assert_eq!(report.total, 0);
    }

    #[tokio::test]
    async fn test_activity_buffered_until_flush() {
        let fx = Fixture::new(10).await;
        let task = fx.ready("r", 20).await;
        let reports = fx.reports();
        reports.apply(task.id, ReportOp::Started).await.unwrap();

        reports.apply(task.id, activity(&["a"])).await.unwrap();
        reports.apply(task.id, activity(&["b\nc"])).await.unwrap();

        // 非 activity 操作先写出缓冲
        reports
            .apply(task.id, ReportOp::Error {
                severity: "Warning".into(),
                description: "slow".into(),
            })
            .await
            .unwrap();
        let stored = fx.gateway.reports.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.activity, vec!["a", "b", "> c"]);
        assert_eq!(stored.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_get_flushes_pending_lines() {
        let fx = Fixture::new(10).await;
        let task = fx.ready("r", 20).await;
        let reports = fx.reports();
        reports.apply(task.id, ReportOp::Started).await.unwrap();
        reports.apply(task.id, activity(&["x"])).await.unwrap();
        reports.apply(task.id, activity(&["y"])).await.unwrap();
        assert_eq!(reports.get(task.id).await.unwrap().activity, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_flush_due_after_interval() {
        let fx = Fixture::new(10).await;
        let task = fx.ready("r", 20).await;
        let reports = fx.reports();
        reports.apply(task.id, ReportOp::Started).await.unwrap();
        reports.apply(task.id, activity(&["x"])).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        reports.flush_due().await;
        let stored = fx.gateway.reports.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.activity, vec!["x"]);
    }

    fn slot_count(reports: &ReportService) -> usize {
        reports.slots.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_finished_reports_release_throttle() {
        let fx = Fixture::new(10).await;
        let reports = fx.reports();
        let mut ids = Vec::new();
        for i in 0..5 {
            let task = fx.ready(&format!("r{i}"), 20).await;
            reports.apply(task.id, ReportOp::Started).await.unwrap();
            reports.apply(task.id, activity(&["working"])).await.unwrap();
            let end = if i % 2 == 0 {
                ReportOp::Succeeded
            } else {
                ReportOp::Failed {
                    reason: "exit 1".into(),
                }
            };
            reports.apply(task.id, end).await.unwrap();
            ids.push(task.id);
        }
        reports.flush_due().await;
        assert_eq!(slot_count(&reports), 0);
        for id in ids {
            let stored = fx.gateway.reports.get(id).await.unwrap().unwrap();
            assert_eq!(stored.activity, vec!["working"]);
        }
    }

    #[tokio::test]
    async fn test_idle_throttle_is_evicted() {
        let fx = Fixture::new(10).await;
        let task = fx.ready("r", 20).await;
        let reports = ReportService::new(
            fx.gateway.clone(),
            fx.files.clone(),
            ReporterConfig {
                min_backoff_ms: 1,
                max_backoff_ms: 5,
            },
            fx.metrics.clone(),
        );
        reports.apply(task.id, ReportOp::Started).await.unwrap();
        reports.apply(task.id, activity(&["a"])).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        reports.flush_due().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        reports.flush_due().await;
        assert_eq!(slot_count(&reports), 0);

        reports.apply(task.id, activity(&["b"])).await.unwrap();
        assert_eq!(reports.get(task.id).await.unwrap().activity, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_attach_requires_file() {
        let fx = Fixture::new(10).await;
        let task = fx.ready("r", 20).await;
        let reports = fx.reports();
        let err = reports
            .apply(task.id, ReportOp::Attach {
                file_id: 99,
                name: "x".into(),
                activity: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let file = fx
            .gateway
            .files
            .create("out.log", "text/plain", fx.files.root(), "")
            .await
            .unwrap();
        for _ in 0..2 {
            reports
                .apply(task.id, ReportOp::Attach {
                    file_id: file.id,
                    name: "out.log".into(),
                    activity: None,
                })
                .await
                .unwrap();
        }
        assert_eq!(reports.get(task.id).await.unwrap().attached.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_task_and_crud() {
        let fx = Fixture::new(10).await;
        let reports = fx.reports();
        assert!(reports
            .apply(404, ReportOp::Started)
            .await
            .unwrap_err()
            .is_not_found());

        let task = fx.ready("r", 20).await;
        let mut report = TaskReport::new(0);
        report.result = json!({"issues": 1});
        let created = reports.create(task.id, report.clone()).await.unwrap();
        assert_eq!(created.task_id, task.id);
        assert!(matches!(
            reports.create(task.id, report.clone()).await,
            Err(HubError::Conflict(_))
        ));

        report.total = 5;
        reports.replace(task.id, report).await.unwrap();
        assert_eq!(reports.get(task.id).await.unwrap().total, 5);

        reports.delete(task.id).await.unwrap();
        assert!(reports.get(task.id).await.unwrap_err().is_not_found());
        assert!(reports.replace(task.id, TaskReport::new(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_op_rejected() {
        let fx = Fixture::new(10).await;
        let task = fx.ready("r", 20).await;
        let reports = fx.reports();
        let err = reports
            .apply(task.id, ReportOp::Result { result: json!([1]) })
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }
}
