//! 进程内模拟集群
//!
//! 按节点容量放置 Pod，维护事件日志。两种推进方式：
//! - `Manual`：Pod 状态只由 [`SimulatedCluster::set_status`] 等方法改变，用于确定性测试
//! - `Timed`：每次查询时按配置的时长自动推进 Pending → Running → Succeeded/Failed

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use taskhub_core::config::{ClusterConfig, SimulationMode};
use taskhub_core::models::{
    AddonSpec, ContainerState, ExtensionSpec, FailureReason, KindSpec, NodeCapacity, PodEvent,
    PodEventBatch, PodEventKind, PodRef, PodSpec, PodState, PodStatus,
};
use taskhub_core::traits::ClusterDriver;
use taskhub_core::{HubError, HubResult};
use tracing::debug;

struct SimPod {
    state: PodState,
    since: DateTime<Utc>,
    logs: BTreeMap<String, String>,
}

#[derive(Default)]
struct ClusterState {
    pods: HashMap<PodRef, SimPod>,
    events: Vec<PodEvent>,
    seq: u64,
    injected_errors: u32,
}

impl ClusterState {
    fn emit(&mut self, pod: &PodRef, task_id: Option<i64>, kind: PodEventKind, message: String) {
        self.seq += 1;
        self.events.push(PodEvent {
            seq: self.seq,
            pod: pod.clone(),
            task_id,
            kind,
            message,
            time: Utc::now(),
        });
    }

    /// 节点上仍占用容量的 Pod 数
    fn load(&self, node: &str) -> u32 {
        self.pods
            .values()
            .filter(|p| p.state.node.as_deref() == Some(node) && !p.state.status.is_finished())
            .count() as u32
    }

    fn place(&self, nodes: &[NodeCapacity], preferred: Option<&str>) -> Option<String> {
        nodes
            .iter()
            .filter(|n| preferred.map_or(true, |p| p == n.name))
            .find(|n| self.load(&n.name) < n.capacity)
            .map(|n| n.name.clone())
    }

    fn take_error(&mut self) -> HubResult<()> {
        if self.injected_errors > 0 {
            self.injected_errors -= 1;
            return Err(HubError::Cluster("模拟的集群瞬时错误".to_string()));
        }
        Ok(())
    }
}

pub struct SimulatedCluster {
    namespace: String,
    config: ClusterConfig,
    state: Mutex<ClusterState>,
}

impl SimulatedCluster {
    pub fn new(namespace: impl Into<String>, config: ClusterConfig) -> Self {
        Self {
            namespace: namespace.into(),
            config,
            state: Mutex::new(ClusterState::default()),
        }
    }

    fn lock(&self) -> HubResult<MutexGuard<'_, ClusterState>> {
        self.state
            .lock()
            .map_err(|_| HubError::Internal("集群状态锁已损坏".to_string()))
    }

    /// 手动设置 Pod 状态并记录对应事件
    pub fn set_status(&self, pod: &PodRef, status: PodStatus) -> HubResult<()> {
        let mut state = self.lock()?;
        Self::apply_status(&mut state, pod, status)
    }

    /// 按任务 id 设置其 Pod 状态
    pub fn set_task_status(&self, task_id: i64, status: PodStatus) -> HubResult<PodRef> {
        let mut state = self.lock()?;
        let pod = state
            .pods
            .values()
            .filter(|p| p.state.task_id == Some(task_id))
            .max_by_key(|p| p.state.created)
            .map(|p| p.state.pod.clone())
            .ok_or_else(|| HubError::not_found("Pod", task_id))?;
        Self::apply_status(&mut state, &pod, status)?;
        Ok(pod)
    }

    /// 设置单个容器状态（模拟主容器结束而 extension 仍在运行）
    pub fn set_container(&self, pod: &PodRef, container: ContainerState) -> HubResult<()> {
        let mut state = self.lock()?;
        let sim = state
            .pods
            .get_mut(pod)
            .ok_or_else(|| HubError::not_found("Pod", pod))?;
        match sim.state.containers.iter_mut().find(|c| c.name == container.name) {
            Some(existing) => *existing = container,
            None => sim.state.containers.push(container),
        }
        Ok(())
    }

    pub fn set_log(&self, pod: &PodRef, container: &str, log: &str) -> HubResult<()> {
        let mut state = self.lock()?;
        let sim = state
            .pods
            .get_mut(pod)
            .ok_or_else(|| HubError::not_found("Pod", pod))?;
        sim.logs.insert(container.to_string(), log.to_string());
        Ok(())
    }

    /// 直接移除 Pod（模拟外部删除）
    pub fn remove(&self, pod: &PodRef) -> HubResult<bool> {
        let mut state = self.lock()?;
        Ok(state.pods.remove(pod).is_some())
    }

    /// 接下来 `count` 次调用返回瞬时错误
    pub fn inject_errors(&self, count: u32) -> HubResult<()> {
        self.lock()?.injected_errors = count;
        Ok(())
    }

    pub fn pod_specs(&self) -> HubResult<Vec<(PodRef, Option<i64>)>> {
        let state = self.lock()?;
        let mut pods: Vec<_> = state
            .pods
            .values()
            .map(|p| (p.state.pod.clone(), p.state.task_id))
            .collect();
        pods.sort();
        Ok(pods)
    }

    fn apply_status(state: &mut ClusterState, pod: &PodRef, status: PodStatus) -> HubResult<()> {
        let sim = state
            .pods
            .get_mut(pod)
            .ok_or_else(|| HubError::not_found("Pod", pod))?;
        let task_id = sim.state.task_id;
        sim.since = Utc::now();
        let (kind, message) = match &status {
            PodStatus::Running => {
                for c in sim.state.containers.iter_mut() {
                    c.running = true;
                }
                (PodEventKind::Started, "Started".to_string())
            }
            PodStatus::Succeeded => {
                for c in sim.state.containers.iter_mut() {
                    c.running = false;
                    c.exit_code = Some(0);
                    c.reason = "Completed".to_string();
                }
                (PodEventKind::Terminated, "Completed".to_string())
            }
            PodStatus::Failed { reason } => {
                let code = match reason {
                    FailureReason::Exit(code) => *code,
                    _ => 1,
                };
                for c in sim.state.containers.iter_mut() {
                    c.running = false;
                    c.exit_code = Some(code);
                    c.reason = reason.to_string();
                }
                (PodEventKind::Terminated, reason.to_string())
            }
            PodStatus::Unschedulable { reason } => (PodEventKind::Unschedulable, reason.clone()),
            PodStatus::Pending { reason } => (PodEventKind::Scheduled, reason.clone()),
            PodStatus::Unknown => (PodEventKind::Scheduled, "Unknown".to_string()),
        };
        sim.state.status = status;
        state.emit(pod, task_id, kind, message);
        Ok(())
    }

    /// Timed 模式下按时间推进 Pod 状态
    fn advance(&self, state: &mut ClusterState) -> HubResult<()> {
        if self.config.mode != SimulationMode::Timed {
            return Ok(());
        }
        let now = Utc::now();
        let pending = Duration::milliseconds(self.config.pending_ms as i64);
        let running = Duration::milliseconds(self.config.running_ms as i64);

        let mut keys: Vec<PodRef> = state.pods.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let (status, since) = match state.pods.get(&key) {
                Some(p) => (p.state.status.clone(), p.since),
                None => continue,
            };
            match status {
                PodStatus::Unschedulable { .. } => {
                    if let Some(node) = state.place(&self.config.nodes, None) {
                        if let Some(p) = state.pods.get_mut(&key) {
                            p.state.node = Some(node.clone());
                        }
                        Self::apply_status(
                            state,
                            &key,
                            PodStatus::Pending {
                                reason: format!("Scheduled on {node}"),
                            },
                        )?;
                    }
                }
                PodStatus::Pending { .. } if now - since >= pending => {
                    Self::apply_status(state, &key, PodStatus::Running)?;
                }
                PodStatus::Running if now - since >= running => {
                    let failed = self.config.failure_rate > 0.0
                        && rand::random::<f64>() < self.config.failure_rate;
                    let next = if failed {
                        PodStatus::Failed {
                            reason: FailureReason::Exit(1),
                        }
                    } else {
                        PodStatus::Succeeded
                    };
                    Self::apply_status(state, &key, next)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterDriver for SimulatedCluster {
    async fn lookup_addon(&self, name: &str) -> HubResult<AddonSpec> {
        self.config
            .addons
            .iter()
            .find(|a| a.name == name)
            .cloned()
            .ok_or_else(|| HubError::AddonNotFound(name.to_string()))
    }

    async fn lookup_extension(&self, name: &str) -> HubResult<ExtensionSpec> {
        self.config
            .extensions
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| HubError::ExtensionNotFound(name.to_string()))
    }

    async fn lookup_kind(&self, name: &str) -> HubResult<KindSpec> {
        self.config
            .kinds
            .iter()
            .find(|k| k.name == name)
            .cloned()
            .ok_or_else(|| HubError::KindNotFound(name.to_string()))
    }

    async fn addons(&self) -> HubResult<Vec<AddonSpec>> {
        Ok(self.config.addons.clone())
    }

    async fn extensions(&self) -> HubResult<Vec<ExtensionSpec>> {
        Ok(self.config.extensions.clone())
    }

    async fn kinds(&self) -> HubResult<Vec<KindSpec>> {
        Ok(self.config.kinds.clone())
    }

    async fn nodes(&self) -> HubResult<Vec<NodeCapacity>> {
        Ok(self.config.nodes.clone())
    }

    async fn create_pod(&self, spec: &PodSpec) -> HubResult<PodRef> {
        let mut state = self.lock()?;
        state.take_error()?;

        let pod = PodRef::new(&self.namespace, &spec.name);
        if state.pods.contains_key(&pod) {
            return Err(HubError::Conflict(format!("Pod 已存在: {pod}")));
        }

        let node = state.place(&self.config.nodes, spec.node.as_deref());
        let status = match &node {
            Some(node) => PodStatus::Pending {
                reason: format!("Scheduled on {node}"),
            },
            None => PodStatus::Unschedulable {
                reason: "0 nodes are available: Insufficient capacity".to_string(),
            },
        };
        let containers = spec
            .containers
            .iter()
            .map(|c| ContainerState {
                name: c.name.clone(),
                running: false,
                exit_code: None,
                reason: String::new(),
            })
            .collect();
        let logs = spec
            .containers
            .iter()
            .map(|c| (c.name.clone(), format!("container {} image {}\n", c.name, c.image)))
            .collect();

        let now = Utc::now();
        state.pods.insert(
            pod.clone(),
            SimPod {
                state: PodState {
                    pod: pod.clone(),
                    task_id: Some(spec.task_id),
                    node: node.clone(),
                    status: status.clone(),
                    containers,
                    created: now,
                },
                since: now,
                logs,
            },
        );
        state.emit(&pod, Some(spec.task_id), PodEventKind::Created, "Created".to_string());
        match status {
            PodStatus::Unschedulable { reason } => {
                state.emit(&pod, Some(spec.task_id), PodEventKind::Unschedulable, reason)
            }
            PodStatus::Pending { reason } => {
                state.emit(&pod, Some(spec.task_id), PodEventKind::Scheduled, reason)
            }
            _ => {}
        }
        debug!("模拟集群创建 Pod {} (节点: {:?})", pod, node);
        Ok(pod)
    }

    async fn get_pod(&self, pod: &PodRef) -> HubResult<Option<PodState>> {
        let mut state = self.lock()?;
        state.take_error()?;
        self.advance(&mut state)?;
        Ok(state.pods.get(pod).map(|p| p.state.clone()))
    }

    async fn delete_pod(&self, pod: &PodRef) -> HubResult<bool> {
        let mut state = self.lock()?;
        state.take_error()?;
        match state.pods.remove(pod) {
            Some(sim) => {
                state.emit(pod, sim.state.task_id, PodEventKind::Deleted, "Deleted".to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_pods(&self) -> HubResult<Vec<PodState>> {
        let mut state = self.lock()?;
        state.take_error()?;
        self.advance(&mut state)?;
        let mut pods: Vec<PodState> = state.pods.values().map(|p| p.state.clone()).collect();
        pods.sort_by(|a, b| a.pod.cmp(&b.pod));
        Ok(pods)
    }

    async fn pod_log(&self, pod: &PodRef, container: &str) -> HubResult<String> {
        let state = self.lock()?;
        let sim = state
            .pods
            .get(pod)
            .ok_or_else(|| HubError::not_found("Pod", pod))?;
        Ok(sim.logs.get(container).cloned().unwrap_or_default())
    }

    async fn kill_container(&self, pod: &PodRef, container: &str) -> HubResult<()> {
        let mut state = self.lock()?;
        state.take_error()?;
        let sim = state
            .pods
            .get_mut(pod)
            .ok_or_else(|| HubError::not_found("Pod", pod))?;
        if let Some(c) = sim.state.containers.iter_mut().find(|c| c.name == container) {
            c.running = false;
            c.exit_code = Some(137);
            c.reason = "Killed".to_string();
        }
        if sim.state.status == PodStatus::Running && sim.state.containers.iter().all(|c| !c.running) {
            // 所有容器都已停止，Pod 结果取决于主容器
            let next = match sim.state.containers.first().and_then(|c| c.exit_code) {
                Some(0) => PodStatus::Succeeded,
                Some(code) => PodStatus::Failed {
                    reason: FailureReason::Exit(code),
                },
                None => PodStatus::Succeeded,
            };
            let task_id = sim.state.task_id;
            sim.state.status = next;
            sim.since = Utc::now();
            state.emit(pod, task_id, PodEventKind::Terminated, "Completed".to_string());
        }
        Ok(())
    }

    async fn pod_events(&self, resume: u64) -> HubResult<PodEventBatch> {
        let mut state = self.lock()?;
        self.advance(&mut state)?;
        let events: Vec<PodEvent> = state
            .events
            .iter()
            .filter(|e| e.seq > resume)
            .cloned()
            .collect();
        let resume = events.last().map(|e| e.seq).unwrap_or(resume);
        Ok(PodEventBatch { events, resume })
    }

    async fn pod_history(&self, pod: &PodRef) -> HubResult<Vec<PodEvent>> {
        let state = self.lock()?;
        Ok(state
            .events
            .iter()
            .filter(|e| &e.pod == pod)
            .cloned()
            .collect())
    }
}
