//! 服务发现客户端
//!
//! 后台同步任务监听注册中心成员变化，重建加权池并整体替换当前
//! 负载均衡器；调用方先走发现池，仅在发现池给出「无可用客户端」
//! 时回退到静态兜底池，构成显式的两级回退链。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::balancer::{Balancer, Pool, Shard};
use crate::client::Client;
use crate::codec::{JsonCodec, SharedCodec};
use crate::config::{BalancePolicy, ClusterConfig};
use crate::error::{Result, RpcError};
use crate::registry::SharedRegistry;
use crate::stat::SharedStat;
use crate::trace::SharedTrace;

/// 注册中心拉取失败或成员为空时的重试间隔
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(1);

/// 服务发现 RPC 客户端（应用侧入口）
pub struct ClusterClient {
    balancer_rx: watch::Receiver<Option<Arc<Balancer>>>,
    backup: Option<Arc<Balancer>>,
    quit: CancellationToken,
}

impl ClusterClient {
    /// 以默认编解码器创建
    pub async fn new(cfg: ClusterConfig, registry: SharedRegistry) -> Self {
        Self::new_with(cfg, registry, Arc::new(JsonCodec), None, None).await
    }

    /// 指定编解码器与可观测性协作方的完整构造
    pub async fn new_with(
        cfg: ClusterConfig,
        registry: SharedRegistry,
        codec: SharedCodec,
        stats: Option<SharedStat>,
        tracer: Option<SharedTrace>,
    ) -> Self {
        let backup = match &cfg.backup {
            Some(targets) if !targets.is_empty() => {
                let mut clients = Vec::with_capacity(targets.len());
                for target in targets {
                    let client = Client::dial_with(
                        target.clone(),
                        codec.clone(),
                        stats.clone(),
                        tracer.clone(),
                    )
                    .await;
                    clients.push(Arc::new(client));
                }
                let servers = clients.len();
                Some(Arc::new(Balancer::Wrr(Pool::new(clients, servers))))
            }
            _ => None,
        };

        let (balancer_tx, balancer_rx) = watch::channel(None);
        let quit = CancellationToken::new();
        tokio::spawn(sync_loop(
            cfg,
            registry,
            codec,
            stats,
            tracer,
            balancer_tx,
            quit.clone(),
        ));
        Self {
            balancer_rx,
            backup,
            quit,
        }
    }

    /// 当前发现池快照，仅用于观测
    pub fn balancer(&self) -> Option<Arc<Balancer>> {
        self.balancer_rx.borrow().clone()
    }

    /// 调用远端方法
    ///
    /// 发现池返回 [`RpcError::NoClient`] 以外的结果直接透传；
    /// 无可用目标时回退兜底池。
    pub async fn call<A, R>(&self, method: &str, args: &A, shard: Shard) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let discovered = self.balancer_rx.borrow().clone();
        if let Some(balancer) = discovered {
            match balancer.call(method, args, shard).await {
                Err(RpcError::NoClient) => {}
                r => return r,
            }
        }
        match &self.backup {
            Some(backup) => backup.call(method, args, shard).await,
            None => Err(RpcError::NoClient),
        }
    }

    /// 广播到发现池与兜底池的全部成员，任一失败即失败
    pub async fn boardcast<A, R>(&self, method: &str, args: &A) -> Result<Vec<R>>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let mut replies = Vec::new();
        let discovered = self.balancer_rx.borrow().clone();
        if let Some(balancer) = discovered {
            replies.extend(balancer.boardcast(method, args).await?);
        }
        if let Some(backup) = &self.backup {
            replies.extend(backup.boardcast(method, args).await?);
        }
        Ok(replies)
    }

    /// 设置发现池的方法级超时覆盖
    pub async fn set_method_timeout(&self, method: &str, timeout: Duration) {
        let discovered = self.balancer_rx.borrow().clone();
        if let Some(balancer) = discovered {
            balancer.set_method_timeout(method, timeout).await;
        }
    }

    /// 设置发现池的基础超时
    pub fn set_timeout(&self, timeout: Duration) {
        let discovered = self.balancer_rx.borrow().clone();
        if let Some(balancer) = discovered {
            balancer.set_timeout(timeout);
        }
    }

    /// 停止同步任务并关闭全部池内客户端
    pub fn close(&self) {
        self.quit.cancel();
        if let Some(backup) = &self.backup {
            backup.close();
        }
    }
}

impl Drop for ClusterClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// 发现同步任务
async fn sync_loop(
    cfg: ClusterConfig,
    registry: SharedRegistry,
    codec: SharedCodec,
    stats: Option<SharedStat>,
    tracer: Option<SharedTrace>,
    balancer_tx: watch::Sender<Option<Arc<Balancer>>>,
    quit: CancellationToken,
) {
    let mut pools: HashMap<String, Arc<Client>> = HashMap::new();
    loop {
        let done = tokio::select! {
            _ = quit.cancelled() => true,
            _ = sync_round(&cfg, &registry, &codec, &stats, &tracer, &balancer_tx, &mut pools) => false,
        };
        if done {
            break;
        }
    }
    for (_, client) in pools.drain() {
        client.close();
    }
}

/// 同步循环体：拉取成员 → 差异建连 → 加权展开 → 发布 → 延迟关闭退役成员
/// → 等待变更通知或轮询间隔
async fn sync_round(
    cfg: &ClusterConfig,
    registry: &SharedRegistry,
    codec: &SharedCodec,
    stats: &Option<SharedStat>,
    tracer: &Option<SharedTrace>,
    balancer_tx: &watch::Sender<Option<Arc<Balancer>>>,
    pools: &mut HashMap<String, Arc<Client>>,
) {
    let (members, mut events) = match registry.watch_members(cfg.group.as_deref()).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "fetch members failed");
            tokio::time::sleep(SYNC_RETRY_DELAY).await;
            return;
        }
    };
    if members.is_empty() {
        error!("no rpc servers");
        let retired: Vec<Arc<Client>> = pools.drain().map(|(_, c)| c).collect();
        remove_and_close(cfg.client.timeout(), retired).await;
        tokio::time::sleep(SYNC_RETRY_DELAY).await;
        return;
    }

    // 新增成员建连，沿用既有连接
    let mut keys = HashSet::with_capacity(members.len());
    let mut clients = Vec::with_capacity(members.len());
    let mut weights: usize = 0;
    for member in &members {
        info!(addr = %member.addr, weight = member.weight, group = ?member.group, "sync member");
        weights += member.weight as usize;
        let key = member.key();
        keys.insert(key.clone());
        let client = match pools.get(&key) {
            Some(c) => c.clone(),
            None => {
                let mut client_cfg = cfg.client.clone();
                client_cfg.proto = member.proto.clone();
                client_cfg.addr = member.addr.clone();
                let client = Arc::new(
                    Client::dial_with(client_cfg, codec.clone(), stats.clone(), tracer.clone())
                        .await,
                );
                pools.insert(key, client.clone());
                client
            }
        };
        clients.push(client);
    }

    // 消失的成员标记退役
    let retired_keys: Vec<String> = pools
        .keys()
        .filter(|k| !keys.contains(*k))
        .cloned()
        .collect();
    let mut retired = Vec::with_capacity(retired_keys.len());
    for key in retired_keys {
        info!(key = %key, "retire member");
        if let Some(client) = pools.remove(&key) {
            retired.push(client);
        }
    }

    // 按剩余权重轮转交错展开，避免大权重成员占据连续区段
    let mut flat = Vec::with_capacity(weights);
    let mut remaining: Vec<u32> = members.iter().map(|m| m.weight).collect();
    let mut next = 0usize;
    while flat.len() < weights {
        let idx = next % members.len();
        if remaining[idx] > 0 {
            remaining[idx] -= 1;
            flat.push(clients[idx].clone());
        }
        next += 1;
    }

    let pool = Pool::new(flat, members.len());
    let balancer = match cfg.policy {
        BalancePolicy::Sharded => Balancer::Sharding(pool),
        BalancePolicy::Weighted => Balancer::Wrr(pool),
    };
    info!(
        policy = ?cfg.policy,
        weights,
        servers = members.len(),
        "publish balancer snapshot"
    );
    balancer_tx.send_replace(Some(Arc::new(balancer)));

    remove_and_close(cfg.client.timeout(), retired).await;

    tokio::select! {
        _ = events.changed() => {
            info!("membership changed");
        }
        _ = tokio::time::sleep(cfg.pull_interval()) => {}
    }
}

/// 退役成员延迟关闭：给已经发往旧池的在途调用留出两倍超时的余量
async fn remove_and_close(timeout: Duration, retired: Vec<Arc<Client>>) {
    if retired.is_empty() {
        return;
    }
    tokio::time::sleep(2 * timeout).await;
    for client in retired {
        client.close();
    }
}
