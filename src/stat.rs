//! 指标上报接口
//!
//! 核心只消费该接口，不提供实现；由宿主进程注入具体的指标后端。

use std::sync::Arc;

/// 指标上报
pub trait Stat: Send + Sync {
    /// 上报耗时（毫秒）
    fn timing(&self, name: &str, millis: i64);

    /// 计数加一
    fn incr(&self, name: &str);

    /// 上报状态值（如熔断器状态）
    fn state(&self, name: &str, value: i64);
}

/// 共享的指标上报句柄
pub type SharedStat = Arc<dyn Stat>;
