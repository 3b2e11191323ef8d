//! RPC 配置定义
//!
//! 时间字段统一以毫秒为单位，便于直接从 toml 反序列化。

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 熔断器配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    /// 滑动窗口时长（毫秒）
    #[serde(default = "default_breaker_window_ms")]
    pub window_ms: u64,
    /// 窗口内的桶数量
    #[serde(default = "default_breaker_buckets")]
    pub buckets: usize,
    /// 触发熔断的失败率阈值
    #[serde(default = "default_breaker_ratio")]
    pub ratio: f32,
    /// 触发熔断的最小请求数
    #[serde(default = "default_breaker_min_requests")]
    pub min_requests: u64,
    /// 熔断后放行探测请求前的休眠时长（毫秒）
    #[serde(default = "default_breaker_sleep_ms")]
    pub sleep_ms: u64,
}

fn default_breaker_window_ms() -> u64 {
    10_000
}

fn default_breaker_buckets() -> usize {
    10
}

fn default_breaker_ratio() -> f32 {
    0.5
}

fn default_breaker_min_requests() -> u64 {
    100
}

fn default_breaker_sleep_ms() -> u64 {
    500
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_ms: default_breaker_window_ms(),
            buckets: default_breaker_buckets(),
            ratio: default_breaker_ratio(),
            min_requests: default_breaker_min_requests(),
            sleep_ms: default_breaker_sleep_ms(),
        }
    }
}

impl BreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_millis(self.sleep_ms)
    }
}

/// 单目标 RPC 客户端配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// 传输协议（目前仅支持 tcp）
    #[serde(default = "default_proto")]
    pub proto: String,
    /// 远端地址 host:port
    pub addr: String,
    /// 调用基础超时（毫秒），可被方法级覆盖
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 建连超时（毫秒）
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// 熔断配置，None 表示该目标不启用熔断
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,
}

fn default_proto() -> String {
    "tcp".to_string()
}

fn default_timeout_ms() -> u64 {
    1_000
}

fn default_dial_timeout_ms() -> u64 {
    1_000
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            proto: default_proto(),
            addr: addr.into(),
            timeout_ms: default_timeout_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            breaker: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BalancePolicy {
    /// 加权轮询
    Weighted,
    /// 按分片键路由
    Sharded,
}

impl Default for BalancePolicy {
    fn default() -> Self {
        BalancePolicy::Weighted
    }
}

/// 服务发现客户端配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// 负载均衡策略
    #[serde(default)]
    pub policy: BalancePolicy,
    /// 分组过滤，None 表示不过滤
    #[serde(default)]
    pub group: Option<String>,
    /// 注册中心全量拉取间隔（毫秒）
    #[serde(default = "default_pull_interval_ms")]
    pub pull_interval_ms: u64,
    /// 每个发现目标的客户端配置模板（addr 由发现结果填充）
    pub client: ClientConfig,
    /// 静态兜底目标，发现池无可用目标时使用
    #[serde(default)]
    pub backup: Option<Vec<ClientConfig>>,
}

fn default_pull_interval_ms() -> u64 {
    30_000
}

impl ClusterConfig {
    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }
}

/// 注册中心连接配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// 注册中心节点地址列表
    pub endpoints: Vec<String>,
    /// 服务成员所在的根路径
    pub root: String,
    /// 注册中心操作超时（毫秒）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 临时成员租约时长（秒）
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    30
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 服务端监听配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// 传输协议（目前仅支持 tcp）
    #[serde(default = "default_proto")]
    pub proto: String,
    /// 监听地址 host:port
    pub addr: String,
    /// 注册到注册中心的权重，0 表示不参与选择
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// 注册分组
    #[serde(default)]
    pub group: Option<String>,
    /// 连接空闲超时（毫秒），超时后服务端关闭连接
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_weight() -> u32 {
    10
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// 顶层配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub client: Option<ClientConfig>,
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
    #[serde(default)]
    pub server: Option<ServerConfig>,
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
