//! 负载均衡模块
//!
//! 两种策略：加权轮询与按分片键路由。池一经构建不可变，
//! 发现循环每轮整体替换，读侧不会看到撕裂的池。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::error;

use crate::client::Client;
use crate::error::{Result, RpcError};

/// 分片路由键，在调用点显式给出
///
/// 分片策略要求 [`Shard::Key`]；没有分片键的参数在分片池上
/// 无法确定目标，调用确定性地以 [`RpcError::NoClient`] 失败。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shard {
    None,
    Key(i64),
}

/// 按权重展开的客户端池
///
/// `clients` 是权重展平后的数组（每个成员出现 weight 次，
/// 轮转交错排列，前 `servers` 个槽位恰好是互不相同的成员）。
pub struct Pool {
    clients: Vec<Arc<Client>>,
    servers: usize,
    cursor: AtomicU64,
}

impl Pool {
    pub fn new(clients: Vec<Arc<Client>>, servers: usize) -> Self {
        Self {
            clients,
            servers,
            cursor: AtomicU64::new(0),
        }
    }

    /// 总权重（展平后的槽位数）
    pub fn weight(&self) -> usize {
        self.clients.len()
    }

    /// 成员数
    pub fn servers(&self) -> usize {
        self.servers
    }

    fn empty(&self) -> bool {
        if self.clients.is_empty() || self.servers == 0 {
            error!(
                weight = self.clients.len(),
                servers = self.servers,
                "balancer pool has no weighted members"
            );
            return true;
        }
        false
    }

    /// 加权轮询：从轮转游标起最多尝试 servers 个连续槽位，
    /// 跳过返回 NoClient 的成员
    async fn call_wrr<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        if self.empty() {
            return Err(RpcError::NoClient);
        }
        let v = self.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..self.servers as u64 {
            let idx = ((v + i) % self.clients.len() as u64) as usize;
            match self.clients[idx].call(method, args).await {
                Err(RpcError::NoClient) => continue,
                r => return r,
            }
        }
        Err(RpcError::NoClient)
    }

    /// 分片路由：key mod servers 确定唯一目标
    async fn call_sharded<A, R>(&self, key: i64, method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        if self.empty() {
            return Err(RpcError::NoClient);
        }
        let idx = key.rem_euclid(self.servers as i64) as usize;
        match self.clients[idx].call(method, args).await {
            Err(RpcError::NoClient) => Err(RpcError::NoClient),
            r => r,
        }
    }

    /// 广播到每个互不相同的成员，首个错误即取消其余调用
    async fn boardcast<A, R>(&self, method: &str, args: &A) -> Result<Vec<R>>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        if self.empty() {
            return Err(RpcError::NoClient);
        }
        let calls = self.clients[..self.servers]
            .iter()
            .map(|c| c.call::<A, R>(method, args));
        futures::future::try_join_all(calls).await
    }

    async fn set_method_timeout(&self, method: &str, timeout: Duration) {
        for client in &self.clients[..self.servers.min(self.clients.len())] {
            client.set_method_timeout(method, timeout).await;
        }
    }

    fn set_timeout(&self, timeout: Duration) {
        for client in &self.clients[..self.servers.min(self.clients.len())] {
            client.set_timeout(timeout);
        }
    }
}

/// 负载均衡器，策略由配置决定
pub enum Balancer {
    /// 加权轮询
    Wrr(Pool),
    /// 按分片键路由
    Sharding(Pool),
}

impl Balancer {
    /// 选择一个成员发起调用
    pub async fn call<A, R>(&self, method: &str, args: &A, shard: Shard) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        match self {
            Balancer::Wrr(pool) => pool.call_wrr(method, args).await,
            Balancer::Sharding(pool) => match shard {
                Shard::Key(key) => pool.call_sharded(key, method, args).await,
                Shard::None => {
                    error!(method = method, "sharded call without shard key");
                    Err(RpcError::NoClient)
                }
            },
        }
    }

    /// 广播到所有成员，要求全部成功
    ///
    /// 原始接口名如此（Boardcast），保留以兼容既有调用方。
    pub async fn boardcast<A, R>(&self, method: &str, args: &A) -> Result<Vec<R>>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.pool().boardcast(method, args).await
    }

    pub async fn set_method_timeout(&self, method: &str, timeout: Duration) {
        self.pool().set_method_timeout(method, timeout).await;
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.pool().set_timeout(timeout);
    }

    /// 总权重（展平后的槽位数）
    pub fn weight(&self) -> usize {
        self.pool().weight()
    }

    /// 成员数
    pub fn servers(&self) -> usize {
        self.pool().servers()
    }

    /// 展平顺序下各槽位的远端地址，仅用于观测
    pub fn endpoints(&self) -> Vec<String> {
        self.pool()
            .clients
            .iter()
            .map(|c| c.remote_addr().to_string())
            .collect()
    }

    /// 关闭池内全部客户端
    pub fn close(&self) {
        for client in &self.pool().clients {
            client.close();
        }
    }

    fn pool(&self) -> &Pool {
        match self {
            Balancer::Wrr(pool) | Balancer::Sharding(pool) => pool,
        }
    }
}
