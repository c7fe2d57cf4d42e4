//! 结构化日志
//!
//! 每个领域事件对应一个函数，字段命名统一为 `task.id`、`pod.name` 等，
//! 便于在 JSON 日志中检索。

use tracing::{debug, error, info, warn};

use taskhub_core::models::{PodRef, TaskState};

pub struct StructuredLogger;

impl StructuredLogger {
    /// 任务状态迁移
    pub fn log_task_transition(task_id: i64, from: TaskState, to: TaskState, kind: &str, reason: &str) {
        info!(
            event = "task_transition",
            task.id = task_id,
            task.from = from.as_str(),
            task.to = to.as_str(),
            event.kind = kind,
            event.reason = reason,
            "任务状态迁移"
        );
    }

    pub fn log_task_created(task_id: i64, name: &str, kind: &str, state: TaskState) {
        info!(
            event = "task_created",
            task.id = task_id,
            task.name = name,
            task.kind = kind,
            task.state = state.as_str(),
            "任务已创建"
        );
    }

    pub fn log_pod_created(task_id: i64, pod: &PodRef, containers: usize) {
        info!(
            event = "pod_created",
            task.id = task_id,
            pod.name = %pod,
            pod.containers = containers,
            "Pod 已创建"
        );
    }

    pub fn log_pod_deleted(task_id: Option<i64>, pod: &PodRef, reason: &str) {
        info!(
            event = "pod_deleted",
            task.id = task_id,
            pod.name = %pod,
            pod.reason = reason,
            "Pod 已删除"
        );
    }

    pub fn log_preemption(victim: i64, victim_priority: i32, by: i64, by_priority: i32) {
        warn!(
            event = "task_preempted",
            task.id = victim,
            task.priority = victim_priority,
            preemptor.id = by,
            preemptor.priority = by_priority,
            "任务被抢占"
        );
    }

    /// 一次调和周期的汇总
    pub fn log_reconcile_tick(
        active: usize,
        admitted: usize,
        postponed: usize,
        blocked: usize,
        duration_ms: u64,
    ) {
        debug!(
            event = "reconcile_tick",
            tick.active = active,
            tick.admitted = admitted,
            tick.postponed = postponed,
            tick.blocked = blocked,
            tick.duration_ms = duration_ms,
            "调和周期完成"
        );
    }

    pub fn log_report_op(task_id: i64, op: &str, generation: i64) {
        debug!(
            event = "report_op",
            task.id = task_id,
            report.op = op,
            report.generation = generation,
            "报告已更新"
        );
    }

    pub fn log_bucket_op(bucket_id: i64, op: &str, path: &str) {
        debug!(
            event = "bucket_op",
            bucket.id = bucket_id,
            bucket.op = op,
            bucket.path = path,
            "Bucket 操作"
        );
    }

    pub fn log_reaped(kind: &str, id: i64, reason: &str) {
        info!(
            event = "reaped",
            reap.kind = kind,
            reap.id = id,
            reap.reason = reason,
            "资源已回收"
        );
    }

    pub fn log_system_error(component: &str, operation: &str, error: &dyn std::error::Error) {
        error!(
            event = "system_error",
            error.component = component,
            error.operation = operation,
            error.message = %error,
            "系统错误"
        );
    }
}
