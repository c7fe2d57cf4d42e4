//! 调度器
//!
//! 纯函数：给定排队中的任务、集群容量和配置的上限，按 (priority desc, id asc)
//! 顺序为每个候选任务给出决策。准入是贪心的，一个候选被准入后，
//! 它的资源占用立即计入后续候选的评估。
//!
//! 决策规则依次为：
//! 1. 流水线前序成员未终止 → Postpone
//! 2. 同一 locator 的任务已在 Pending/Running → Postpone
//! 3. 依赖的任务类型在同一主体上仍在排队 → Postpone
//! 4. 超出全局、按类型或节点容量 → 尝试抢占，否则 QuotaBlocked
//! 5. 否则 Admit

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use taskhub_core::models::{event, KindSpec, NodeCapacity, Task, TaskState};

/// 调度上限
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub max_running: u32,
    pub kind_caps: HashMap<String, u32>,
    pub preemption_enabled: bool,
}

/// 本周期的集群视图
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub nodes: Vec<NodeCapacity>,
    pub kinds: HashMap<String, KindSpec>,
    /// 容量监视器给出的有效全局上限
    pub limit: u32,
}

impl ClusterView {
    fn weight(&self, kind: &str) -> u32 {
        self.kinds.get(kind).map(|k| k.weight.max(1)).unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admit {
        node: Option<String>,
        /// 需要先抢占的任务
        preempt: Vec<i64>,
    },
    Postpone {
        reason: String,
    },
    QuotaBlocked {
        reason: String,
    },
}

/// 运行视图中的一个占用
#[derive(Debug, Clone)]
struct Slot {
    id: i64,
    kind: String,
    locator: String,
    node: Option<String>,
    priority: i32,
    started: Option<DateTime<Utc>>,
    preemptible: bool,
    running: bool,
}

impl Slot {
    fn of(task: &Task, node: Option<String>) -> Self {
        Self {
            id: task.id,
            kind: task.kind.clone(),
            locator: task.locator.clone(),
            node,
            priority: task.priority,
            started: task.started,
            preemptible: task.policy.preemptible(),
            running: task.state == TaskState::Running,
        }
    }
}

enum Blocked {
    Global(u32),
    Kind(u32),
    Capacity,
    Isolated,
}

pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// 候选任务的评估顺序
    pub fn order(a: &Task, b: &Task) -> Ordering {
        b.priority.cmp(&a.priority).then(a.id.cmp(&b.id))
    }

    /// 为 `queued` 中处于 Ready/Postponed/QuotaBlocked 的任务给出决策
    ///
    /// `queued` 应包含所有排队状态的任务（含 Pending/Running），
    /// `pipelines` 为流水线任务组的成员 (id, state)，按声明顺序排列。
    pub fn schedule(
        &self,
        queued: &[Task],
        pipelines: &HashMap<i64, Vec<(i64, TaskState)>>,
        view: &ClusterView,
    ) -> Vec<(i64, Decision)> {
        let mut running: Vec<Slot> = queued
            .iter()
            .filter(|t| t.state.has_pod())
            .map(|t| Slot::of(t, t.node.clone()))
            .collect();

        let mut candidates: Vec<&Task> = queued
            .iter()
            .filter(|t| TaskState::SCHEDULABLE.contains(&t.state))
            .collect();
        candidates.sort_by(|a, b| Self::order(a, b));

        let mut decisions = Vec::with_capacity(candidates.len());
        for task in candidates {
            let decision = self.decide(task, queued, pipelines, view, &mut running);
            decisions.push((task.id, decision));
        }
        decisions
    }

    fn decide(
        &self,
        task: &Task,
        queued: &[Task],
        pipelines: &HashMap<i64, Vec<(i64, TaskState)>>,
        view: &ClusterView,
        running: &mut Vec<Slot>,
    ) -> Decision {
        if let Some(reason) = pipeline_rule(task, pipelines) {
            return Decision::Postpone { reason };
        }
        if let Some(reason) = locator_rule(task, running) {
            return Decision::Postpone { reason };
        }
        if let Some(reason) = dependency_rule(task, queued, view) {
            return Decision::Postpone { reason };
        }

        match self.fit(task, running, view, &[]) {
            Ok(node) => {
                running.push(Slot::of(task, node.clone()));
                Decision::Admit {
                    node,
                    preempt: Vec::new(),
                }
            }
            Err(Blocked::Isolated) => Decision::Postpone {
                reason: format!("Rule:Isolated kind:{}", task.kind),
            },
            Err(blocked) => {
                if self.config.preemption_enabled {
                    if let Some((node, victims)) = self.preempt(task, running, view) {
                        running.retain(|s| !victims.contains(&s.id));
                        running.push(Slot::of(task, node.clone()));
                        return Decision::Admit {
                            node,
                            preempt: victims,
                        };
                    }
                }
                let reason = match blocked {
                    Blocked::Global(cap) => format!("Quota: max running {cap} reached"),
                    Blocked::Kind(cap) => {
                        format!("Quota: kind '{}' max running {cap} reached", task.kind)
                    }
                    _ => "Quota: insufficient node capacity".to_string(),
                };
                Decision::QuotaBlocked { reason }
            }
        }
    }

    fn kind_cap(&self, kind: &str, view: &ClusterView) -> Option<u32> {
        let configured = self.config.kind_caps.get(kind).copied().filter(|c| *c > 0);
        let declared = view
            .kinds
            .get(kind)
            .map(|k| k.max_running)
            .filter(|c| *c > 0);
        match (configured, declared) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// 检查任务能否放入，忽略 `excluded` 中的占用；成功时返回选中的节点
    fn fit(
        &self,
        task: &Task,
        running: &[Slot],
        view: &ClusterView,
        excluded: &[i64],
    ) -> Result<Option<String>, Blocked> {
        let active: Vec<&Slot> = running.iter().filter(|s| !excluded.contains(&s.id)).collect();

        let limit = view.limit.min(self.config.max_running).max(1);
        if active.len() as u32 >= limit {
            return Err(Blocked::Global(limit));
        }
        if let Some(cap) = self.kind_cap(&task.kind, view) {
            let same = active.iter().filter(|s| s.kind == task.kind).count() as u32;
            if same >= cap {
                return Err(Blocked::Kind(cap));
            }
        }
        if view.nodes.is_empty() {
            return Ok(None);
        }

        let weight = view.weight(&task.kind);
        let mut isolated_only = false;
        let mut best: Option<(&NodeCapacity, u32)> = None;
        for node in &view.nodes {
            let used: u32 = active
                .iter()
                .filter(|s| s.node.as_deref() == Some(node.name.as_str()))
                .map(|s| view.weight(&s.kind))
                .sum();
            let free = node.capacity.saturating_sub(used);
            if free < weight {
                continue;
            }
            if task.policy.isolated
                && active
                    .iter()
                    .any(|s| s.node.as_deref() == Some(node.name.as_str()) && s.kind == task.kind)
            {
                isolated_only = true;
                continue;
            }
            if best.map_or(true, |(_, f)| free > f) {
                best = Some((node, free));
            }
        }
        match best {
            Some((node, _)) => Ok(Some(node.name.clone())),
            None if isolated_only => Err(Blocked::Isolated),
            None => Err(Blocked::Capacity),
        }
    }

    /// 选择最小的抢占集合：优先级最低者优先，同优先级最早启动者优先
    fn preempt(
        &self,
        task: &Task,
        running: &[Slot],
        view: &ClusterView,
    ) -> Option<(Option<String>, Vec<i64>)> {
        let mut eligible: Vec<&Slot> = running
            .iter()
            .filter(|s| s.running && s.preemptible && s.priority < task.priority)
            .collect();
        eligible.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.started.cmp(&b.started))
                .then(b.id.cmp(&a.id))
        });

        let mut victims = Vec::new();
        for slot in eligible {
            victims.push(slot.id);
            if let Ok(node) = self.fit(task, running, view, &victims) {
                // 去掉对结果没有贡献的受害者
                let mut minimal = victims.clone();
                let mut i = 0;
                while i < minimal.len() {
                    let mut trial = minimal.clone();
                    trial.remove(i);
                    if self.fit(task, running, view, &trial).is_ok() {
                        minimal = trial;
                    } else {
                        i += 1;
                    }
                }
                let node = self.fit(task, running, view, &minimal).ok().unwrap_or(node);
                return Some((node, minimal));
            }
        }
        None
    }
}

fn pipeline_rule(task: &Task, pipelines: &HashMap<i64, Vec<(i64, TaskState)>>) -> Option<String> {
    let members = pipelines.get(&task.task_group_id?)?;
    members
        .iter()
        .take_while(|(id, _)| *id != task.id)
        .find(|(_, state)| *state != TaskState::Succeeded)
        .map(|(id, _)| format!("Rule:Pipeline predecessor:{id}"))
}

fn locator_rule(task: &Task, running: &[Slot]) -> Option<String> {
    if task.locator.is_empty() {
        return None;
    }
    running
        .iter()
        .find(|s| s.id != task.id && s.locator == task.locator)
        .map(|s| format!("Rule:Locator matched:{}, other:{}", task.id, s.id))
}

fn dependency_rule(task: &Task, queued: &[Task], view: &ClusterView) -> Option<String> {
    let kind = view.kinds.get(&task.kind)?;
    if kind.dependencies.is_empty() {
        return None;
    }
    let subject = task.subject()?;
    queued
        .iter()
        .filter(|other| other.id != task.id && !other.is_terminal())
        .filter(|other| kind.dependencies.contains(&other.kind))
        .find(|other| other.subject().as_deref() == Some(subject.as_str()))
        .map(|other| {
            format!(
                "Rule:Dependency matched:{}, other:{} kind:{}",
                task.id, other.id, other.kind
            )
        })
}

/// 提升被依赖任务的优先级
///
/// 排队中的任务依赖（按类型）同一主体上优先级更低的排队任务时，
/// 后者的优先级被提升到前者，返回被修改的任务 id。
pub fn escalate(queued: &mut [Task], kinds: &HashMap<String, KindSpec>) -> Vec<i64> {
    let mut changed = Vec::new();
    loop {
        let mut raise: Option<(usize, i32, i64)> = None;
        'outer: for (i, dependent) in queued.iter().enumerate() {
            if !TaskState::QUEUED.contains(&dependent.state) {
                continue;
            }
            let Some(kind) = kinds.get(&dependent.kind) else {
                continue;
            };
            let Some(subject) = dependent.subject() else {
                continue;
            };
            for (j, dep) in queued.iter().enumerate() {
                if i == j
                    || !TaskState::QUEUED.contains(&dep.state)
                    || !kind.dependencies.contains(&dep.kind)
                    || dep.priority >= dependent.priority
                    || dep.subject().as_deref() != Some(subject.as_str())
                {
                    continue;
                }
                raise = Some((j, dependent.priority, dependent.id));
                break 'outer;
            }
        }
        let Some((j, priority, by)) = raise else {
            break;
        };
        let dep = &mut queued[j];
        dep.priority = priority;
        dep.event(event::ESCALATED, format!("Escalated:{}, by:{}", dep.id, by));
        if !changed.contains(&dep.id) {
            changed.push(dep.id);
        }
    }
    changed
}
