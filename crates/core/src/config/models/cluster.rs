use serde::{Deserialize, Serialize};

use crate::models::{AddonSpec, ExtensionSpec, KindSpec, NodeCapacity};

/// 模拟集群的 Pod 推进方式
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SimulationMode {
    /// 由调用方显式设置 Pod 状态
    Manual,
    /// 按配置的时长自动推进
    #[default]
    Timed,
}

/// 集群配置：注册表与模拟节点
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub mode: SimulationMode,
    pub nodes: Vec<NodeCapacity>,
    pub addons: Vec<AddonSpec>,
    pub extensions: Vec<ExtensionSpec>,
    pub kinds: Vec<KindSpec>,
    pub pending_ms: u64,
    pub running_ms: u64,
    /// 超时模式下 Pod 失败的概率（0.0-1.0）
    pub failure_rate: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: SimulationMode::Timed,
            nodes: vec![NodeCapacity {
                name: "node-1".to_string(),
                capacity: 10,
            }],
            addons: Vec::new(),
            extensions: Vec::new(),
            kinds: Vec::new(),
            pending_ms: 1000,
            running_ms: 5000,
            failure_rate: 0.0,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.nodes.is_empty() {
            return Err(anyhow::anyhow!("集群至少需要一个节点"));
        }
        if self.nodes.iter().any(|n| n.name.is_empty()) {
            return Err(anyhow::anyhow!("节点名称不能为空"));
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(anyhow::anyhow!("失败概率必须在0.0到1.0之间"));
        }
        for addon in &self.addons {
            if addon.name.is_empty() || addon.image.is_empty() {
                return Err(anyhow::anyhow!("Addon名称和镜像不能为空"));
            }
        }
        Ok(())
    }
}
