//! 任务编排的指标采集
//!
//! 指标句柄在构造时通过 `metrics` 宏注册，实际导出由安装的 recorder 决定
//! （未安装 recorder 时为空操作）。

use anyhow::Result;
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use taskhub_core::models::{QueueReport, TaskState};
use tracing::debug;

pub struct MetricsCollector {
    tasks_created_total: Counter,
    pods_created_total: Counter,
    preemptions_total: Counter,
    reports_total: Counter,
    reaped_total: Counter,
    cluster_capacity: Gauge,
    reconcile_duration: Histogram,
    task_duration: Histogram,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tasks_created_total: counter!("taskhub_tasks_created_total"),
            pods_created_total: counter!("taskhub_pods_created_total"),
            preemptions_total: counter!("taskhub_preemptions_total"),
            reports_total: counter!("taskhub_reports_total"),
            reaped_total: counter!("taskhub_reaped_total"),
            cluster_capacity: gauge!("taskhub_cluster_capacity"),
            reconcile_duration: histogram!("taskhub_reconcile_duration_seconds"),
            task_duration: histogram!("taskhub_task_duration_seconds"),
        })
    }

    pub fn record_task_created(&self) {
        self.tasks_created_total.increment(1);
    }

    /// 记录一次状态迁移，终态时同时记录任务耗时
    pub fn record_transition(&self, to: TaskState, duration_seconds: Option<f64>) {
        counter!("taskhub_task_transitions_total", "to" => to.as_str()).increment(1);
        if let Some(seconds) = duration_seconds.filter(|s| *s >= 0.0) {
            self.task_duration.record(seconds);
        }
    }

    pub fn record_pod_created(&self) {
        self.pods_created_total.increment(1);
    }

    pub fn record_preemption(&self) {
        self.preemptions_total.increment(1);
    }

    pub fn record_report(&self) {
        self.reports_total.increment(1);
    }

    pub fn record_reaped(&self, count: u64) {
        self.reaped_total.increment(count);
    }

    pub fn update_queue(&self, report: &QueueReport) {
        let depths = [
            (TaskState::Ready, report.ready),
            (TaskState::Postponed, report.postponed),
            (TaskState::Pending, report.pending),
            (TaskState::QuotaBlocked, report.quota_blocked),
            (TaskState::Running, report.running),
        ];
        for (state, depth) in depths {
            gauge!("taskhub_queue_depth", "state" => state.as_str()).set(depth as f64);
        }
        debug!(
            queue.total = report.total,
            queue.running = report.running,
            "队列深度已更新"
        );
    }

    pub fn update_capacity(&self, capacity: f64) {
        self.cluster_capacity.set(capacity);
    }

    pub fn record_reconcile(&self, duration_seconds: f64) {
        self.reconcile_duration.record(duration_seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_without_recorder() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_task_created();
        collector.record_transition(TaskState::Succeeded, Some(1.5));
        collector.update_queue(&QueueReport {
            ready: 1,
            running: 2,
            total: 3,
            ..Default::default()
        });
        collector.record_reconcile(0.01);
    }
}
