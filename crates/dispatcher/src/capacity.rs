//! 集群容量监视
//!
//! 观察到新的不可调度 Pod 时立即收缩有效上限，之后每个没有不可调度 Pod 的周期
//! 恢复 5%，直到配置的最大值。

/// 每个空闲周期的恢复比例
const RECOVERY_FACTOR: f64 = 1.05;

#[derive(Debug, Clone)]
pub struct CapacityMonitor {
    max: u32,
    current: f64,
}

impl CapacityMonitor {
    pub fn new(max: u32) -> Self {
        let max = max.max(1);
        Self {
            max,
            current: max as f64,
        }
    }

    /// 当前有效上限
    pub fn limit(&self) -> u32 {
        (self.current.ceil() as u32).clamp(1, self.max)
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    /// 根据本周期的观察调整上限
    ///
    /// `scheduled` 为当前已调度（Pending/Running）的任务数，
    /// `unschedulable` 为本周期新出现的不可调度事件数，
    /// `blocked` 表示是否仍有处于不可调度状态的 Pod。
    pub fn observe(&mut self, scheduled: u32, unschedulable: u32, blocked: bool) -> u32 {
        if unschedulable > 0 {
            let shrunk = scheduled.saturating_sub(unschedulable).max(1);
            self.current = (shrunk as f64).min(self.current);
        } else if !blocked {
            self.current = (self.current * RECOVERY_FACTOR).min(self.max as f64);
        }
        self.limit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shrinks_on_unschedulable() {
        let mut monitor = CapacityMonitor::new(10);
        assert_eq!(monitor.limit(), 10);
        assert_eq!(monitor.observe(6, 2, true), 4);
        // 仍然阻塞时不恢复
        assert_eq!(monitor.observe(4, 0, true), 4);
    }

    #[test]
    fn test_recovers_gradually() {
        let mut monitor = CapacityMonitor::new(10);
        monitor.observe(3, 3, true);
        assert_eq!(monitor.limit(), 1);
        assert_eq!(monitor.observe(1, 0, false), 2);
        for _ in 0..100 {
            monitor.observe(1, 0, false);
        }
        assert_eq!(monitor.limit(), 10);
    }
}
