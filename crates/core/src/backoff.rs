//! 退避策略

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 有界指数退避配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// 最大尝试次数（包括第一次）
    pub max_attempts: u32,
    /// 基础间隔（毫秒）
    pub base_interval_ms: u64,
    /// 最大间隔（毫秒）
    pub max_interval_ms: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_interval_ms: 100,
            max_interval_ms: 2000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败（从 0 开始）之后的等待时间
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_interval_ms as f64;
        let capped = (base * self.backoff_multiplier.powi(attempt as i32))
            .min(self.max_interval_ms as f64);
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let millis = (capped + jitter).clamp(0.0, self.max_interval_ms as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("重试次数必须大于0"));
        }
        if self.base_interval_ms > self.max_interval_ms {
            return Err(anyhow::anyhow!("基础重试间隔不能大于最大重试间隔"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动系数必须在0.0到1.0之间"));
        }
        Ok(())
    }
}

/// 乘性增加、加性减少的间隔
///
/// 写入压力时间隔翻倍，成功时减少一个最小步长，始终位于 `[min, max]`。
#[derive(Debug, Clone)]
pub struct AimdBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl AimdBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn pressure(&mut self) -> Duration {
        self.current = (self.current * 2).clamp(self.min, self.max);
        self.current
    }

    pub fn success(&mut self) -> Duration {
        self.current = self.current.saturating_sub(self.min).max(self.min);
        self.current
    }
}

/// 加性退避：无新数据时逐步增加等待时间，有数据时重置
#[derive(Debug, Clone)]
pub struct AdditiveBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl AdditiveBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn idle(&mut self) -> Duration {
        self.current = (self.current + self.min).min(self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
