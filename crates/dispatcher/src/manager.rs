//! 任务管理器
//!
//! 周期性的调和循环，每个周期依次：
//! 1. 读取 Pod 事件，更新容量监视器
//! 2. 处理取消请求
//! 3. 并发查询 Pending/Running 任务的 Pod，反映到任务状态
//! 4. 处理 Running TTL
//! 5. 推进流水线任务组
//! 6. 提升依赖优先级并调度（准入、抢占、推迟、配额阻塞）
//! 7. 收集已终止任务的日志和快照，按保留期删除 Pod
//! 8. 删除孤儿 Pod
//! 9. 更新任务组聚合状态，完成延迟删除
//!
//! 单个任务的保存遇到版本冲突时跳过该任务，下一周期重新读取。

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, Utc};
use futures::{stream, FutureExt, StreamExt};
use serde::Serialize;
use taskhub_core::config::{HubConfig, ManagerConfig};
use taskhub_core::models::{
    data, event, AddonSpec, ContainerSpec, ExtensionSpec, FailureReason, GroupMode, KindSpec,
    PodEvent, PodEventKind, PodRef, PodSpec, PodState, PodStatus, ReportStatus, Task, TaskGroup,
    TaskState,
};
use taskhub_core::traits::ClusterDriver;
use taskhub_core::{HubError, HubResult};
use taskhub_infrastructure::{BucketStore, FileStore, MetricsCollector, StructuredLogger};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capacity::CapacityMonitor;
use crate::gateway::PersistenceGateway;
use crate::group::purge_group;
use crate::retry::with_retry;
use crate::scheduler::{escalate, ClusterView, Decision, Scheduler, SchedulerConfig};

/// 调和循环关心的非终态
const ACTIVE_STATES: [TaskState; 6] = [
    TaskState::Created,
    TaskState::Ready,
    TaskState::Postponed,
    TaskState::QuotaBlocked,
    TaskState::Pending,
    TaskState::Running,
];

/// Pod 快照附件名
pub const POD_SNAPSHOT: &str = "pod.yaml";

/// 一次调和周期的统计
#[derive(Debug, Clone, Default)]
pub struct TickSummary {
    pub active: usize,
    pub admitted: usize,
    pub postponed: usize,
    pub blocked: usize,
    pub preempted: usize,
    pub collected: usize,
    pub orphans: usize,
    pub limit: u32,
}

#[derive(Serialize)]
struct PodSnapshot<'a> {
    pod: &'a PodState,
    events: &'a [PodEvent],
}

type Working = BTreeMap<i64, Task>;

pub struct TaskManager {
    gateway: PersistenceGateway,
    cluster: Arc<dyn ClusterDriver>,
    files: FileStore,
    buckets: BucketStore,
    config: ManagerConfig,
    hub: HubConfig,
    scheduler: Scheduler,
    capacity: Mutex<CapacityMonitor>,
    events: Mutex<Option<mpsc::Receiver<PodEvent>>>,
    metrics: Arc<MetricsCollector>,
}

impl TaskManager {
    pub fn new(
        gateway: PersistenceGateway,
        cluster: Arc<dyn ClusterDriver>,
        files: FileStore,
        buckets: BucketStore,
        config: ManagerConfig,
        hub: HubConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_running: config.max_running,
            kind_caps: config.kind_caps.clone(),
            preemption_enabled: config.preemption_enabled,
        });
        let capacity = Mutex::new(CapacityMonitor::new(config.max_running));
        Self {
            gateway,
            cluster,
            files,
            buckets,
            config,
            hub,
            scheduler,
            capacity,
            events: Mutex::new(None),
            metrics,
        }
    }

    /// 接入 Pod 事件泵的接收端
    pub fn with_events(self, receiver: mpsc::Receiver<PodEvent>) -> Self {
        if let Ok(mut slot) = self.events.lock() {
            *slot = Some(receiver);
        }
        self
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("启动任务管理器，调和间隔 {}ms", self.config.tick_interval_ms);
        let mut ticker = tokio::time::interval(StdDuration::from_millis(self.config.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_guarded().await;
                }
                _ = shutdown.recv() => {
                    info!("任务管理器收到关闭信号");
                    break;
                }
            }
        }
    }

    /// 执行一个周期，吞掉错误与 panic
    pub async fn tick_guarded(&self) -> Option<TickSummary> {
        match AssertUnwindSafe(self.tick()).catch_unwind().await {
            Ok(Ok(summary)) => Some(summary),
            Ok(Err(e)) => {
                StructuredLogger::log_system_error("manager", "tick", &e);
                None
            }
            Err(panic) => {
                error!("调和周期发生 panic: {}", panic_message(panic.as_ref()));
                None
            }
        }
    }

    pub async fn tick(&self) -> HubResult<TickSummary> {
        let started = Instant::now();
        let mut summary = TickSummary::default();
        let pumped = self.drain_events();

        let mut tasks: Working = self
            .gateway
            .tasks
            .list_by_states(&ACTIVE_STATES)
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        self.process_cancels(&mut tasks).await?;
        let (noted, blocked) = self.observe_pods(&mut tasks).await?;
        self.expire_running(&mut tasks).await?;
        let pipelines = self.advance_pipelines(&mut tasks).await?;

        let scheduled = tasks.values().filter(|t| t.state.has_pod()).count() as u32;
        let limit = match self.capacity.lock() {
            Ok(mut monitor) => monitor.observe(scheduled, pumped.max(noted), blocked),
            Err(poisoned) => poisoned.into_inner().limit(),
        };
        self.metrics.update_capacity(limit as f64);
        summary.limit = limit;

        self.schedule(&mut tasks, &pipelines, limit, &mut summary)
            .await?;
        summary.active = tasks.values().filter(|t| !t.is_terminal()).count();

        summary.collected = self.collect_pods().await?;
        summary.orphans = self.delete_orphans().await?;
        self.reconcile_groups().await?;

        let queue = self.gateway.tasks.queue_counts(None).await?;
        self.metrics.update_queue(&queue);

        let elapsed = started.elapsed();
        self.metrics.record_reconcile(elapsed.as_secs_f64());
        StructuredLogger::log_reconcile_tick(
            summary.active,
            summary.admitted,
            summary.postponed,
            summary.blocked,
            elapsed.as_millis() as u64,
        );
        Ok(summary)
    }

    /// 读取事件泵转发的事件，返回新的不可调度事件数
    fn drain_events(&self) -> u32 {
        let mut slot = match self.events.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(receiver) = slot.as_mut() else {
            return 0;
        };
        let mut unschedulable = 0;
        while let Ok(event) = receiver.try_recv() {
            debug!("Pod事件: {} {:?} {}", event.pod, event.kind, event.message);
            if event.kind == PodEventKind::Unschedulable {
                unschedulable += 1;
            }
        }
        unschedulable
    }

    fn transition(
        &self,
        task: &mut Task,
        next: TaskState,
        kind: &str,
        reason: impl Into<String>,
    ) -> HubResult<()> {
        let from = task.state;
        let reason = reason.into();
        task.transition(next, kind, reason.as_str())?;
        StructuredLogger::log_task_transition(task.id, from, next, kind, &reason);
        let duration = match (next.is_terminal(), task.started, task.terminated) {
            (true, Some(started), Some(terminated)) => {
                Some((terminated - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        };
        self.metrics.record_transition(next, duration);
        Ok(())
    }

    /// 保存任务，版本冲突时返回 false
    async fn save(&self, task: &mut Task) -> HubResult<bool> {
        match self.gateway.tasks.update(task).await {
            Ok(saved) => {
                *task = saved;
                Ok(true)
            }
            Err(HubError::Conflict(reason)) => {
                debug!("任务 {} 版本冲突，本周期跳过: {}", task.id, reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// 保存任务；版本冲突时换成持久化中的最新版本，使其继续占用本周期的调度容量
    async fn save_or_refresh(&self, tasks: &mut Working, mut task: Task) -> HubResult<()> {
        let id = task.id;
        if self.save(&mut task).await? {
            tasks.insert(id, task);
            return Ok(());
        }
        match self.gateway.tasks.get(id).await? {
            Some(fresh) if !fresh.is_terminal() => {
                tasks.insert(id, fresh);
            }
            _ => {
                tasks.remove(&id);
            }
        }
        Ok(())
    }

    async fn process_cancels(&self, tasks: &mut Working) -> HubResult<()> {
        let ids: Vec<i64> = tasks
            .values()
            .filter(|t| t.cancel_requested && !t.is_terminal())
            .map(|t| t.id)
            .collect();
        for id in ids {
            let Some(mut task) = tasks.remove(&id) else {
                continue;
            };
            self.transition(&mut task, TaskState::Canceled, event::CANCELED, "")?;
            if task.task_group_id.is_some() {
                // 组成员只放弃对共享 bucket 的引用
                task.bucket_id = None;
            }
            self.save_or_refresh(tasks, task).await?;
        }
        Ok(())
    }

    /// 返回 (新出现的不可调度数, 是否仍有不可调度的 Pod)
    async fn observe_pods(&self, tasks: &mut Working) -> HubResult<(u32, bool)> {
        let probes: Vec<(i64, Option<PodRef>)> = tasks
            .values()
            .filter(|t| t.state.has_pod())
            .map(|t| (t.id, t.pod.clone()))
            .collect();
        if probes.is_empty() {
            return Ok((0, false));
        }

        let fanout = self.config.fanout_ceiling.clamp(1, probes.len());
        let cluster = &self.cluster;
        let policy = &self.config.retry;
        let observed: Vec<(i64, HubResult<Option<PodState>>)> = stream::iter(probes)
            .map(|(id, pod)| async move {
                let result = match pod {
                    Some(pod) => with_retry(policy, "get_pod", || cluster.get_pod(&pod)).await,
                    None => Ok(None),
                };
                (id, result)
            })
            .buffer_unordered(fanout)
            .collect()
            .await;

        let mut noted = 0;
        let mut blocked = false;
        for (id, result) in observed {
            let pod = match result {
                Ok(pod) => pod,
                Err(e) => {
                    StructuredLogger::log_system_error("manager", "get_pod", &e);
                    continue;
                }
            };
            let Some(mut task) = tasks.remove(&id) else {
                continue;
            };
            if let Some(PodStatus::Unschedulable { .. }) = pod.as_ref().map(|p| &p.status) {
                blocked = true;
                if !task.events.last().is_some_and(|e| e.kind == event::POD_UNSCHEDULABLE) {
                    noted += 1;
                }
            }

            let outcome = AssertUnwindSafe(self.reflect(&mut task, pod))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(true)) => self.save_or_refresh(tasks, task).await?,
                Ok(Ok(false)) => {
                    tasks.insert(id, task);
                }
                Ok(Err(e)) => {
                    warn!("反映任务 {} 的Pod状态失败: {}", id, e);
                    tasks.insert(id, task);
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!("反映任务 {} 时发生 panic: {}", id, message);
                    self.fail_after_panic(tasks, id, message).await?;
                }
            }
        }
        Ok((noted, blocked))
    }

    /// 以持久化中的最新版本将任务置为失败，已终结的任务保持不变
    async fn fail_after_panic(
        &self,
        tasks: &mut Working,
        id: i64,
        message: String,
    ) -> HubResult<()> {
        let Some(mut fresh) = self.gateway.tasks.get(id).await? else {
            return Ok(());
        };
        if fresh.is_terminal() {
            return Ok(());
        }
        fresh.error("Error", format!("panic: {message}"));
        if let Err(e) = self.transition(&mut fresh, TaskState::Failed, event::PANIC, message) {
            warn!("任务 {} 无法标记为失败: {}", id, e);
            tasks.insert(id, fresh);
            return Ok(());
        }
        self.save_or_refresh(tasks, fresh).await
    }

    /// 将观察到的 Pod 状态反映到任务上，返回任务是否被修改
    async fn reflect(&self, task: &mut Task, observed: Option<PodState>) -> HubResult<bool> {
        let Some(pod) = observed else {
            let name = task.pod.take().map(|p| p.to_string()).unwrap_or_default();
            task.error("Error", format!("Pod not found: {name}"));
            self.transition(task, TaskState::Failed, event::POD_NOT_FOUND, name)?;
            return Ok(true);
        };

        match pod.status.clone() {
            PodStatus::Pending { reason } => {
                Ok(task.state == TaskState::Pending && note(task, event::POD_PENDING, &reason))
            }
            PodStatus::Unschedulable { reason } => self.unschedulable(task, &pod, &reason).await,
            PodStatus::Running => {
                let mut changed = self.ensure_running(task, &pod)?;
                changed |= self.kill_zombies(task, &pod).await?;
                Ok(changed)
            }
            PodStatus::Succeeded => {
                self.ensure_running(task, &pod)?;
                let report = self.gateway.reports.get(task.id).await?;
                match report {
                    Some(report) if report.status == ReportStatus::Failed => {
                        let reason = report
                            .errors
                            .last()
                            .map(|e| e.description.clone())
                            .unwrap_or_else(|| "Addon reported failure.".to_string());
                        task.error("Error", reason.clone());
                        self.transition(task, TaskState::Failed, event::ADDON_FAILED, reason)?;
                    }
                    _ => {
                        self.transition(task, TaskState::Succeeded, event::POD_SUCCEEDED, "")?;
                    }
                }
                Ok(true)
            }
            PodStatus::Failed { reason } => {
                match &reason {
                    FailureReason::ImagePull(message) => {
                        task.error("Error", format!("ImagePull: {message}"));
                        self.transition(task, TaskState::Failed, event::IMAGE_ERROR, "ImagePull")?;
                    }
                    FailureReason::Killed(message) => {
                        task.error("Error", format!("Killed: {message}"));
                        self.transition(
                            task,
                            TaskState::Failed,
                            event::CONTAINER_KILLED,
                            message.as_str(),
                        )?;
                    }
                    other => {
                        task.error("Error", other.to_string());
                        self.transition(task, TaskState::Failed, event::POD_FAILED, other.to_string())?;
                    }
                }
                Ok(true)
            }
            PodStatus::Unknown => Ok(false),
        }
    }

    fn ensure_running(&self, task: &mut Task, pod: &PodState) -> HubResult<bool> {
        let mut changed = false;
        if task.state == TaskState::Pending {
            let node = pod.node.clone().unwrap_or_default();
            self.transition(task, TaskState::Running, event::POD_RUNNING, node)?;
            changed = true;
        }
        if task.started.is_none() {
            task.started = Some(Utc::now());
            changed = true;
        }
        if task.node.is_none() && pod.node.is_some() {
            task.node = pod.node.clone();
            changed = true;
        }
        Ok(changed)
    }

    async fn unschedulable(&self, task: &mut Task, pod: &PodState, reason: &str) -> HubResult<bool> {
        if task.state != TaskState::Pending {
            return Ok(false);
        }
        let changed = note(task, event::POD_UNSCHEDULABLE, reason);
        let backoff = Duration::seconds(self.config.unschedulable_backoff_seconds as i64);
        if Utc::now() - pod.created < backoff {
            return Ok(changed);
        }

        with_retry(&self.config.retry, "delete_pod", || self.cluster.delete_pod(&pod.pod)).await?;
        StructuredLogger::log_pod_deleted(Some(task.id), &pod.pod, "unschedulable");
        task.pod = None;
        task.node = None;
        if task.retries >= self.config.max_retries {
            task.error("Error", format!("Pod unschedulable: {reason}"));
            self.transition(task, TaskState::Failed, event::POD_UNSCHEDULABLE, reason)?;
        } else {
            task.retries += 1;
            let reason = format!("retry {} of {}", task.retries, self.config.max_retries);
            self.transition(task, TaskState::Ready, event::RETRIED, reason)?;
        }
        Ok(true)
    }

    /// 主容器结束后仍在运行的 extension 容器
    async fn kill_zombies(&self, task: &mut Task, pod: &PodState) -> HubResult<bool> {
        let Some(main) = pod.containers.first() else {
            return Ok(false);
        };
        if main.running || main.exit_code.is_none() {
            return Ok(false);
        }
        let mut changed = false;
        for container in pod.containers.iter().skip(1).filter(|c| c.running) {
            with_retry(&self.config.retry, "kill_container", || {
                self.cluster.kill_container(&pod.pod, &container.name)
            })
            .await?;
            task.event(
                event::CONTAINER_KILLED,
                format!("container: '{}' had not terminated.", container.name),
            );
            changed = true;
        }
        Ok(changed)
    }

    async fn expire_running(&self, tasks: &mut Working) -> HubResult<()> {
        let now = Utc::now();
        let ids: Vec<i64> = tasks
            .values()
            .filter(|t| t.running_ttl_expired(now))
            .map(|t| t.id)
            .collect();
        for id in ids {
            let Some(mut task) = tasks.remove(&id) else {
                continue;
            };
            task.error("Error", format!("Running TTL ({}m) expired.", task.ttl.running));
            self.transition(&mut task, TaskState::Failed, event::TTL_EXPIRED, "Running")?;
            self.save_or_refresh(tasks, task).await?;
        }
        Ok(())
    }

    /// 释放或取消流水线中的后续成员，返回流水线成员状态
    async fn advance_pipelines(
        &self,
        tasks: &mut Working,
    ) -> HubResult<HashMap<i64, Vec<(i64, TaskState)>>> {
        let mut pipelines = HashMap::new();
        for group in self.gateway.groups.list_active().await? {
            if group.mode != GroupMode::Pipeline || group.state != TaskState::Ready {
                continue;
            }
            let mut members = group.tasks;
            for member in members.iter_mut() {
                if let Some(current) = tasks.get(&member.id) {
                    *member = current.clone();
                }
            }
            for i in 1..members.len() {
                let (prev_id, prev_state) = (members[i - 1].id, members[i - 1].state);
                let current = &mut members[i];
                if current.is_terminal() {
                    continue;
                }
                match prev_state {
                    TaskState::Succeeded
                        if current.state == TaskState::Created && !current.cancel_requested =>
                    {
                        let reason = format!("predecessor:{prev_id} succeeded");
                        self.transition(current, TaskState::Ready, event::RELEASED, reason)?;
                    }
                    // 无论后续成员是否已被提交，前驱失败或取消时一律取消
                    TaskState::Failed | TaskState::Canceled => {
                        let reason = format!("predecessor:{prev_id} {prev_state}");
                        self.transition(current, TaskState::Canceled, event::CANCELED, reason)?;
                        current.bucket_id = None;
                    }
                    _ => continue,
                }
                self.save_or_refresh(tasks, current.clone()).await?;
                if let Some(saved) = tasks.get(&current.id) {
                    *current = saved.clone();
                }
            }
            pipelines.insert(group.id, members.iter().map(|t| (t.id, t.state)).collect());
        }
        Ok(pipelines)
    }

    async fn schedule(
        &self,
        tasks: &mut Working,
        pipelines: &HashMap<i64, Vec<(i64, TaskState)>>,
        limit: u32,
        summary: &mut TickSummary,
    ) -> HubResult<()> {
        let kinds: HashMap<String, KindSpec> =
            with_retry(&self.config.retry, "kinds", || self.cluster.kinds())
                .await?
                .into_iter()
                .map(|k| (k.name.clone(), k))
                .collect();

        let mut queued: Vec<Task> = tasks
            .values()
            .filter(|t| TaskState::QUEUED.contains(&t.state))
            .cloned()
            .collect();
        if queued.is_empty() {
            return Ok(());
        }
        for id in escalate(&mut queued, &kinds) {
            if let Some(task) = queued.iter().find(|t| t.id == id) {
                self.save_or_refresh(tasks, task.clone()).await?;
            }
        }
        // 已被删除的任务不参与本周期调度
        queued.retain(|t| tasks.contains_key(&t.id));
        for task in queued.iter_mut() {
            if let Some(saved) = tasks.get(&task.id) {
                *task = saved.clone();
            }
        }

        let view = ClusterView {
            nodes: with_retry(&self.config.retry, "nodes", || self.cluster.nodes()).await?,
            kinds,
            limit,
        };
        for (id, decision) in self.scheduler.schedule(&queued, pipelines, &view) {
            let Some(mut task) = tasks.remove(&id) else {
                continue;
            };
            match decision {
                Decision::Admit { node, preempt } => {
                    if !self.preempt(tasks, &preempt, &task).await? {
                        tasks.insert(id, task);
                        continue;
                    }
                    summary.preempted += preempt.len();
                    if self.start(&mut task, node).await? {
                        summary.admitted += 1;
                    }
                    tasks.insert(id, task);
                }
                Decision::Postpone { reason } => {
                    summary.postponed += 1;
                    self.hold(tasks, task, TaskState::Postponed, event::POSTPONED, &reason)
                        .await?;
                }
                Decision::QuotaBlocked { reason } => {
                    summary.blocked += 1;
                    self.hold(tasks, task, TaskState::QuotaBlocked, event::QUOTA_BLOCKED, &reason)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// 推迟或配额阻塞；只在状态或原因变化时保存
    async fn hold(
        &self,
        tasks: &mut Working,
        mut task: Task,
        state: TaskState,
        kind: &str,
        reason: &str,
    ) -> HubResult<()> {
        if task.state == state {
            if note(&mut task, kind, reason) {
                return self.save_or_refresh(tasks, task).await;
            }
            tasks.insert(task.id, task);
            return Ok(());
        }
        if task.state != TaskState::Ready {
            self.transition(&mut task, TaskState::Ready, event::RELEASED, "")?;
        }
        self.transition(&mut task, state, kind, reason)?;
        self.save_or_refresh(tasks, task).await
    }

    /// 抢占受害者：删除 Pod 并退回 Ready，任一失败则放弃本次准入
    async fn preempt(&self, tasks: &mut Working, victims: &[i64], by: &Task) -> HubResult<bool> {
        for id in victims {
            let Some(mut victim) = tasks.remove(id) else {
                return Ok(false);
            };
            if let Some(pod) = victim.pod.clone() {
                let deleted =
                    with_retry(&self.config.retry, "delete_pod", || self.cluster.delete_pod(&pod))
                        .await;
                if let Err(e) = deleted {
                    StructuredLogger::log_system_error("manager", "preempt", &e);
                    tasks.insert(*id, victim);
                    return Ok(false);
                }
                StructuredLogger::log_pod_deleted(Some(victim.id), &pod, "preempted");
            }
            victim.pod = None;
            victim.node = None;
            self.transition(
                &mut victim,
                TaskState::Ready,
                event::PREEMPTED,
                format!("Preempted by:{}", by.id),
            )?;
            StructuredLogger::log_preemption(victim.id, victim.priority, by.id, by.priority);
            self.metrics.record_preemption();
            self.save_or_refresh(tasks, victim).await?;
        }
        Ok(true)
    }

    /// 选择 addon/extension，创建 Pod，任务进入 Pending
    async fn start(&self, task: &mut Task, node: Option<String>) -> HubResult<bool> {
        if task.state != TaskState::Ready {
            self.transition(task, TaskState::Ready, event::RELEASED, "")?;
        }
        let (addon, extensions) = match self.select(task).await {
            Ok(selected) => selected,
            Err(e) if e.is_validation() => {
                let reason = match e {
                    HubError::BadRequest(reason) => reason,
                    other => other.to_string(),
                };
                task.error("Error", reason.clone());
                self.transition(task, TaskState::Failed, event::ADDON_FAILED, reason)?;
                self.save(task).await?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let token = Uuid::new_v4().simple().to_string();
        let (spec, env) = self.pod_spec(task, &addon, &extensions, &token, node);
        let pod = match with_retry(&self.config.retry, "create_pod", || {
            self.cluster.create_pod(&spec)
        })
        .await
        {
            Ok(pod) => pod,
            Err(e) => {
                StructuredLogger::log_system_error("manager", "create_pod", &e);
                self.save(task).await?;
                return Ok(false);
            }
        };

        task.data = data::substitute(&task.data, &env);
        task.pod = Some(pod.clone());
        task.node = spec.node.clone();
        task.token = Some(token);
        self.transition(task, TaskState::Pending, event::POD_CREATED, pod.to_string())?;
        StructuredLogger::log_pod_created(task.id, &pod, spec.containers.len());
        self.metrics.record_pod_created();

        if !self.save(task).await? {
            // 任务已被并发修改，撤销刚创建的 Pod
            if let Err(e) = self.cluster.delete_pod(&pod).await {
                StructuredLogger::log_system_error("manager", "delete_pod", &e);
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn select(&self, task: &mut Task) -> HubResult<(AddonSpec, Vec<ExtensionSpec>)> {
        let addon = if task.addon.is_empty() {
            let addons = with_retry(&self.config.retry, "addons", || self.cluster.addons()).await?;
            let addon = addons
                .into_iter()
                .find(|a| a.handles(&task.kind))
                .ok_or_else(|| HubError::bad_request("Addon not selected."))?;
            task.addon = addon.name.clone();
            task.event(event::ADDON_SELECTED, addon.name.as_str());
            addon
        } else {
            let addon = self.cluster.lookup_addon(&task.addon).await?;
            task.event(event::ADDON_SELECTED, addon.name.as_str());
            addon
        };

        let mut extensions = Vec::new();
        if task.extensions.is_empty() {
            let available =
                with_retry(&self.config.retry, "extensions", || self.cluster.extensions()).await?;
            for ext in available {
                if ext.applies_to(&addon.name) && ext.handles(&task.kind) {
                    task.extensions.push(ext.name.clone());
                    task.event(event::EXT_SELECTED, ext.name.as_str());
                    extensions.push(ext);
                }
            }
        } else {
            for name in &task.extensions {
                let ext = self.cluster.lookup_extension(name).await?;
                if !ext.applies_to(&addon.name) {
                    return Err(HubError::bad_request(format!(
                        "Extension: '{name}' not supported by addon: '{}'.",
                        addon.name
                    )));
                }
                extensions.push(ext);
            }
        }
        Ok((addon, extensions))
    }

    /// 构造 Pod 定义，同时返回数据文档替换使用的变量
    fn pod_spec(
        &self,
        task: &Task,
        addon: &AddonSpec,
        extensions: &[ExtensionSpec],
        token: &str,
        node: Option<String>,
    ) -> (PodSpec, BTreeMap<String, String>) {
        let base = BTreeMap::from([
            ("HUB_URL".to_string(), self.hub.url.clone()),
            ("TASK".to_string(), task.id.to_string()),
            ("HUB_TOKEN".to_string(), token.to_string()),
            ("SHARED_DIR".to_string(), self.hub.shared_dir.clone()),
            ("CACHE_DIR".to_string(), self.hub.cache_dir.clone()),
        ]);

        let mut namespaced = BTreeMap::new();
        let mut substitution = BTreeMap::new();
        for ext in extensions {
            let prefix = format!("_EXT_{}_", env_key(&ext.name));
            for (key, value) in &ext.env {
                namespaced.insert(format!("{prefix}{}", env_key(key)), value.clone());
                substitution.insert(key.clone(), value.clone());
            }
        }
        substitution.extend(namespaced.clone());

        let mut containers = Vec::with_capacity(extensions.len() + 1);
        let mut env = base.clone();
        env.extend(addon.env.clone());
        env.extend(namespaced.clone());
        containers.push(ContainerSpec {
            name: addon.name.clone(),
            image: addon.image.clone(),
            env,
        });
        for ext in extensions {
            let mut env = base.clone();
            env.extend(ext.env.clone());
            env.extend(namespaced.clone());
            containers.push(ContainerSpec {
                name: ext.name.clone(),
                image: ext.image.clone(),
                env,
            });
        }

        let spec = PodSpec {
            task_id: task.id,
            name: format!("task-{}-{}", task.id, &token[..8]),
            node,
            containers,
            labels: BTreeMap::from([
                ("app".to_string(), "taskhub".to_string()),
                ("task".to_string(), task.id.to_string()),
                ("addon".to_string(), addon.name.clone()),
            ]),
        };
        (spec, substitution)
    }

    /// 已终止任务：收集日志与快照，保留期过后删除 Pod
    async fn collect_pods(&self) -> HubResult<usize> {
        let mut deleted = 0;
        for mut task in self.gateway.tasks.list_with_pod().await? {
            match self.collect_pod(&mut task).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => warn!("清理任务 {} 的Pod失败: {}", task.id, e),
            }
        }
        Ok(deleted)
    }

    async fn collect_pod(&self, task: &mut Task) -> HubResult<bool> {
        let Some(pod) = task.pod.clone() else {
            return Ok(false);
        };
        let state = with_retry(&self.config.retry, "get_pod", || self.cluster.get_pod(&pod)).await?;
        let mut changed = false;
        if let Some(state) = &state {
            if !task.attached.iter().any(|a| a.name == POD_SNAPSHOT) {
                self.attach_pod_files(task, state).await?;
                changed = true;
            }
        }

        let retention = match task.state {
            TaskState::Succeeded => self.config.pod_retention_succeeded_seconds,
            TaskState::Failed => self.config.pod_retention_failed_seconds,
            _ => 0,
        };
        let now = Utc::now();
        let terminated = task.terminated.unwrap_or(now);
        if now - terminated < Duration::seconds(retention as i64) {
            if changed {
                self.save(task).await?;
            }
            return Ok(false);
        }

        if state.is_some() {
            with_retry(&self.config.retry, "delete_pod", || self.cluster.delete_pod(&pod)).await?;
            task.event(event::POD_DELETED, pod.to_string());
            StructuredLogger::log_pod_deleted(Some(task.id), &pod, "retention");
        }
        task.pod = None;
        self.save(task).await
    }

    async fn attach_pod_files(&self, task: &mut Task, state: &PodState) -> HubResult<()> {
        for container in &state.containers {
            match self.cluster.pod_log(&state.pod, &container.name).await {
                Ok(log) => {
                    let name = format!("{}.log", container.name);
                    self.attach_file(task, &name, "text/plain", log.as_bytes())
                        .await?;
                }
                Err(e) => warn!("读取容器 {} 日志失败: {}", container.name, e),
            }
        }
        let history = self.cluster.pod_history(&state.pod).await?;
        let snapshot = serde_yaml::to_string(&PodSnapshot {
            pod: state,
            events: &history,
        })
        .map_err(|e| HubError::Serialization(e.to_string()))?;
        self.attach_file(task, POD_SNAPSHOT, "application/x-yaml", snapshot.as_bytes())
            .await
    }

    async fn attach_file(
        &self,
        task: &mut Task,
        name: &str,
        encoding: &str,
        content: &[u8],
    ) -> HubResult<()> {
        let file = self
            .gateway
            .files
            .create(name, encoding, self.files.root(), "")
            .await?;
        self.files.write(&file, content).await?;
        task.attach(file.id, name);
        Ok(())
    }

    /// 删除任务未知、或任务已不再持有的 Pod
    async fn delete_orphans(&self) -> HubResult<usize> {
        let pods = with_retry(&self.config.retry, "list_pods", || self.cluster.list_pods()).await?;
        let mut deleted = 0;
        for pod in pods {
            let task = match pod.task_id {
                Some(id) => self.gateway.tasks.get(id).await?,
                None => None,
            };
            if task.as_ref().is_some_and(|t| t.pod.as_ref() == Some(&pod.pod)) {
                continue;
            }
            with_retry(&self.config.retry, "delete_pod", || self.cluster.delete_pod(&pod.pod))
                .await?;
            StructuredLogger::log_pod_deleted(pod.task_id, &pod.pod, "orphan");
            if let Some(mut task) = task {
                task.event(event::POD_DELETED, format!("orphan: {}", pod.pod));
                self.save(&mut task).await?;
            }
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn reconcile_groups(&self) -> HubResult<()> {
        for group in self.gateway.groups.list_active().await? {
            if group.delete_requested {
                self.finish_group_delete(group).await?;
                continue;
            }
            if let Some(state) = TaskGroup::aggregate_state(&group.tasks) {
                if state != group.state {
                    self.gateway.groups.set_state(group.id, state).await?;
                    info!("任务组 {} 已完成: {}", group.id, state);
                }
            }
        }
        Ok(())
    }

    async fn finish_group_delete(&self, group: TaskGroup) -> HubResult<()> {
        let mut pending = false;
        for member in &group.tasks {
            if member.is_terminal() && member.pod.is_none() {
                continue;
            }
            pending = true;
            if !member.is_terminal() && !member.cancel_requested {
                let mut member = member.clone();
                member.cancel_requested = true;
                self.save(&mut member).await?;
            }
        }
        if !pending {
            purge_group(&self.gateway, &self.buckets, &group).await?;
            info!("任务组 {} 延迟删除完成", group.id);
        }
        Ok(())
    }
}

/// 与最后一条事件不同时才追加
fn note(task: &mut Task, kind: &str, reason: &str) -> bool {
    if task
        .events
        .last()
        .is_some_and(|e| e.kind == kind && e.reason == reason)
    {
        return false;
    }
    task.event(kind, reason);
    true
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{manager_config, Fixture};
    use taskhub_core::models::{ContainerState, ReportOp, TaskPolicy, TaskReport};

    fn events(task: &Task) -> Vec<&str> {
        task.events.iter().map(|e| e.kind.as_str()).collect()
    }

    #[tokio::test]
    async fn test_happy_path_collects_logs() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let task = fx.ready("t1", 20).await;

        manager.tick().await.unwrap();
        let pending = fx.load(task.id).await;
        assert_eq!(pending.state, TaskState::Pending);
        let pod = pending.pod.clone().unwrap();
        assert!(pending.token.is_some());

        fx.cluster.set_status(&pod, PodStatus::Running).unwrap();
        manager.tick().await.unwrap();
        assert_eq!(fx.load(task.id).await.state, TaskState::Running);

        fx.cluster.set_status(&pod, PodStatus::Succeeded).unwrap();
        manager.tick().await.unwrap();
        let done = fx.load(task.id).await;
        assert_eq!(done.state, TaskState::Succeeded);
        assert!(done.pod.is_none());
        assert!(done.terminated.unwrap() >= done.started.unwrap());
        let kinds = events(&done);
        for expected in [event::POD_CREATED, event::POD_RUNNING, event::POD_SUCCEEDED, event::POD_DELETED] {
            assert!(kinds.contains(&expected), "missing {expected} in {kinds:?}");
        }
        let names: Vec<&str> = done.attached.iter().map(|a| a.name.as_str()).collect();
        assert!(names.contains(&"analyzer.log"));
        assert!(names.contains(&"java-provider.log"));
        assert!(names.contains(&POD_SNAPSHOT));
        assert!(fx.cluster.pod_specs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pod_env_and_data_substitution() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let mut task = Task::new("env");
        task.addon = "analyzer".into();
        task.state = TaskState::Ready;
        task.data = serde_json::json!({"port": "$(PORT)", "other": "$(UNKNOWN)"});
        let task = fx.insert(task).await;

        manager.tick().await.unwrap();
        let loaded = fx.load(task.id).await;
        assert_eq!(loaded.extensions, vec!["java-provider".to_string()]);
        assert!(events(&loaded).contains(&event::EXT_SELECTED));
        assert_eq!(loaded.data["port"], "8000");
        assert_eq!(loaded.data["other"], "$(UNKNOWN)");

        let pod = loaded.pod.unwrap();
        let state = fx.cluster.get_pod(&pod).await.unwrap().unwrap();
        assert_eq!(state.containers.len(), 2);
    }

    #[tokio::test]
    async fn test_addon_not_selected_fails_task() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let mut task = Task::new("orphan-kind");
        task.kind = "unmatched".into();
        task.state = TaskState::Ready;
        let task = fx.gateway.tasks.create(&task).await.unwrap();

        manager.tick().await.unwrap();
        let loaded = fx.load(task.id).await;
        assert_eq!(loaded.state, TaskState::Failed);
        assert!(loaded.errors[0].description.contains("Addon not selected"));
    }

    #[tokio::test]
    async fn test_preemption_restores_victim() {
        let fx = Fixture::new(1).await;
        let manager = fx.manager(manager_config());
        let mut low = Task::new("low");
        low.addon = "analyzer".into();
        low.extensions = vec!["java-provider".into()];
        low.priority = 11;
        low.state = TaskState::Ready;
        low.policy = TaskPolicy {
            preempt_enabled: true,
            ..Default::default()
        };
        let low = fx.insert(low).await;

        manager.tick().await.unwrap();
        let pod = fx.load(low.id).await.pod.unwrap();
        fx.cluster.set_status(&pod, PodStatus::Running).unwrap();
        manager.tick().await.unwrap();
        assert_eq!(fx.load(low.id).await.state, TaskState::Running);

        let high = fx.ready("high", 19).await;
        manager.tick().await.unwrap();
        let victim = fx.load(low.id).await;
        let winner = fx.load(high.id).await;
        assert_eq!(victim.state, TaskState::Ready);
        assert_eq!(victim.retries, 0);
        assert!(events(&victim).contains(&event::PREEMPTED));
        assert_eq!(winner.state, TaskState::Pending);
        assert!(fx.cluster.get_pod(&pod).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quota_blocked_until_capacity_frees() {
        let fx = Fixture::new(10).await;
        let mut config = manager_config();
        config.max_running = 1;
        let manager = fx.manager(config);
        let first = fx.ready("first", 20).await;
        let second = fx.ready("second", 15).await;

        manager.tick().await.unwrap();
        assert_eq!(fx.load(first.id).await.state, TaskState::Pending);
        let blocked = fx.load(second.id).await;
        assert_eq!(blocked.state, TaskState::QuotaBlocked);
        let version = blocked.version;

        manager.tick().await.unwrap();
        // 原因未变化时不保存
        assert_eq!(fx.load(second.id).await.version, version);

        let pod = fx.load(first.id).await.pod.unwrap();
        fx.cluster.set_status(&pod, PodStatus::Succeeded).unwrap();
        manager.tick().await.unwrap();
        manager.tick().await.unwrap();
        let released = fx.load(second.id).await;
        assert_eq!(released.state, TaskState::Pending);
        assert!(events(&released).contains(&event::RELEASED));
    }

    #[tokio::test]
    async fn test_image_pull_is_fatal() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let task = fx.ready("img", 20).await;
        manager.tick().await.unwrap();
        let pod = fx.load(task.id).await.pod.unwrap();
        fx.cluster
            .set_status(
                &pod,
                PodStatus::Failed {
                    reason: FailureReason::ImagePull("ErrImagePull".into()),
                },
            )
            .unwrap();
        manager.tick().await.unwrap();
        let failed = fx.load(task.id).await;
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.retries, 0);
        assert!(events(&failed).contains(&event::IMAGE_ERROR));
        assert!(failed.errors[0].description.starts_with("ImagePull"));
    }

    #[tokio::test]
    async fn test_unschedulable_retries_then_fails() {
        let fx = Fixture::new(10).await;
        let mut config = manager_config();
        config.max_retries = 1;
        let manager = fx.manager(config);
        let task = fx.ready("unsched", 20).await;

        manager.tick().await.unwrap();
        let pod = fx.load(task.id).await.pod.unwrap();
        let reason = PodStatus::Unschedulable {
            reason: "Insufficient cpu".into(),
        };
        fx.cluster.set_status(&pod, reason.clone()).unwrap();
        manager.tick().await.unwrap();
        let retried = fx.load(task.id).await;
        assert_eq!(retried.retries, 1);
        assert!(events(&retried).contains(&event::RETRIED));
        // 同一周期重新调度，已创建新 Pod
        assert_eq!(retried.state, TaskState::Pending);

        fx.cluster.set_task_status(task.id, reason).unwrap();
        manager.tick().await.unwrap();
        let failed = fx.load(task.id).await;
        assert_eq!(failed.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_report_failure_fails_task() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let task = fx.ready("reported", 20).await;
        manager.tick().await.unwrap();

        let mut report = TaskReport::new(task.id);
        report.apply(ReportOp::Started).unwrap();
        report
            .apply(ReportOp::Failed {
                reason: "analysis crashed".into(),
            })
            .unwrap();
        fx.gateway.reports.save(&report).await.unwrap();

        fx.cluster.set_task_status(task.id, PodStatus::Succeeded).unwrap();
        manager.tick().await.unwrap();
        let failed = fx.load(task.id).await;
        assert_eq!(failed.state, TaskState::Failed);
        assert!(events(&failed).contains(&event::ADDON_FAILED));
    }

    #[tokio::test]
    async fn test_zombie_extension_is_killed() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let task = fx.ready("zombie", 20).await;
        manager.tick().await.unwrap();
        let pod = fx.load(task.id).await.pod.unwrap();
        fx.cluster.set_status(&pod, PodStatus::Running).unwrap();
        fx.cluster
            .set_container(
                &pod,
                ContainerState {
                    name: "analyzer".into(),
                    running: false,
                    exit_code: Some(0),
                    reason: "Completed".into(),
                },
            )
            .unwrap();

        manager.tick().await.unwrap();
        let running = fx.load(task.id).await;
        assert!(events(&running).contains(&event::CONTAINER_KILLED));

        manager.tick().await.unwrap();
        assert_eq!(fx.load(task.id).await.state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn test_missing_pod_fails_task() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let task = fx.ready("gone", 20).await;
        manager.tick().await.unwrap();
        let pod = fx.load(task.id).await.pod.unwrap();
        fx.cluster.remove(&pod).unwrap();

        manager.tick().await.unwrap();
        let failed = fx.load(task.id).await;
        assert_eq!(failed.state, TaskState::Failed);
        assert!(events(&failed).contains(&event::POD_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_cancel_requested() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let task = fx.ready("cancel", 20).await;
        manager.tick().await.unwrap();
        let mut loaded = fx.load(task.id).await;
        let pod = loaded.pod.clone().unwrap();
        loaded.cancel_requested = true;
        fx.gateway.tasks.update(&loaded).await.unwrap();

        manager.tick().await.unwrap();
        let canceled = fx.load(task.id).await;
        assert_eq!(canceled.state, TaskState::Canceled);
        assert!(canceled.pod.is_none());
        assert!(fx.cluster.get_pod(&pod).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_cluster_errors_are_retried() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let task = fx.ready("flaky", 20).await;
        fx.cluster.inject_errors(2).unwrap();
        manager.tick().await.unwrap();
        assert_eq!(fx.load(task.id).await.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_orphan_pods_are_deleted() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        fx.cluster
            .create_pod(&PodSpec {
                task_id: 999,
                name: "task-999-stale".into(),
                node: None,
                containers: Vec::new(),
                labels: BTreeMap::new(),
            })
            .await
            .unwrap();
        let summary = manager.tick().await.unwrap();
        assert_eq!(summary.orphans, 1);
        assert!(fx.cluster.pod_specs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_running_ttl_expiry_fails_task() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let task = fx.ready("ttl", 20).await;
        manager.tick().await.unwrap();
        let pod = fx.load(task.id).await.pod.unwrap();
        fx.cluster.set_status(&pod, PodStatus::Running).unwrap();
        manager.tick().await.unwrap();

        let mut running = fx.load(task.id).await;
        assert_eq!(running.state, TaskState::Running);
        running.ttl.running = 1;
        running.started = Some(Utc::now() - Duration::minutes(2));
        fx.gateway.tasks.update(&running).await.unwrap();

        manager.tick().await.unwrap();
        let expired = fx.load(task.id).await;
        assert_eq!(expired.state, TaskState::Failed);
        assert!(events(&expired).contains(&event::TTL_EXPIRED));
        assert!(expired.errors[0].description.contains("Running TTL"));
        assert!(expired.pod.is_none());
        assert!(fx.cluster.get_pod(&pod).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflicting_save_keeps_task_occupying_capacity() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let task = fx.ready("busy", 20).await;
        manager.tick().await.unwrap();
        let stale = fx.load(task.id).await;
        assert_eq!(stale.state, TaskState::Pending);

        // 并发的 API 更新使内存中的副本过期
        let mut renamed = stale.clone();
        renamed.name = "renamed".into();
        fx.gateway.tasks.update(&renamed).await.unwrap();

        let mut moved = stale.clone();
        moved
            .transition(TaskState::Running, event::POD_RUNNING, "")
            .unwrap();
        let mut tasks = Working::new();
        manager.save_or_refresh(&mut tasks, moved).await.unwrap();

        let kept = tasks.get(&task.id).unwrap();
        assert_eq!(kept.name, "renamed");
        assert_eq!(kept.state, TaskState::Pending);
        assert!(kept.state.has_pod());
    }

    #[tokio::test]
    async fn test_panic_recovery_skips_terminal_task() {
        let fx = Fixture::new(10).await;
        let manager = fx.manager(manager_config());
        let mut done = Task::new("done");
        done.state = TaskState::Succeeded;
        let done = fx.insert(done).await;

        let mut tasks = Working::new();
        manager
            .fail_after_panic(&mut tasks, done.id, "boom".into())
            .await
            .unwrap();
        assert_eq!(fx.load(done.id).await.state, TaskState::Succeeded);

        let live = fx.ready("live", 20).await;
        manager
            .fail_after_panic(&mut tasks, live.id, "boom".into())
            .await
            .unwrap();
        let failed = fx.load(live.id).await;
        assert_eq!(failed.state, TaskState::Failed);
        assert!(events(&failed).contains(&event::PANIC));
    }

    #[test]
    fn test_env_key() {
        assert_eq!(env_key("java-provider"), "JAVA_PROVIDER");
        assert_eq!(env_key("port"), "PORT");
    }
}
