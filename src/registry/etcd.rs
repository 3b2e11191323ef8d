//! etcd 注册中心实现
//!
//! 成员写入 `{root}/{lease_id}`，值为 JSON 编码的 [`Member`]，
//! 挂在租约上并由后台任务续约；进程退出后节点随租约过期消失。
//! 变更通知来自对 root 前缀的 watch。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{Member, MembershipEvents, Registry, filter_members};
use crate::config::RegistryConfig;
use crate::error::{Result, RpcError};

struct Registration {
    lease_id: i64,
    keep_alive: JoinHandle<()>,
}

/// etcd 注册中心
pub struct EtcdRegistry {
    client: Client,
    root: String,
    ttl: i64,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl EtcdRegistry {
    /// 连接 etcd
    pub async fn connect(cfg: &RegistryConfig) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(cfg.timeout());
        let client = Client::connect(cfg.endpoints.clone(), Some(options))
            .await
            .map_err(|e| RpcError::registry(format!("etcd connect: {}", e)))?;
        Ok(Self {
            client,
            root: cfg.root.trim_end_matches('/').to_string(),
            ttl: cfg.ttl_secs as i64,
            registrations: Mutex::new(HashMap::new()),
        })
    }

    fn node_key(&self, lease_id: i64) -> String {
        format!("{}/{}", self.root, lease_id)
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn watch_members(&self, group: Option<&str>) -> Result<(Vec<Member>, MembershipEvents)> {
        let mut client = self.client.clone();
        let resp = client
            .get(self.root.clone(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| RpcError::registry(format!("etcd get: {}", e)))?;

        let mut members = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice::<Member>(kv.value()) {
                Ok(m) => members.push(m),
                Err(e) => {
                    // 坏节点跳过，不影响其余成员
                    error!(
                        key = %String::from_utf8_lossy(kv.key()),
                        error = %e,
                        "decode member node failed"
                    );
                }
            }
        }
        let members = filter_members(members, group);

        let (watcher, mut stream) = client
            .watch(self.root.clone(), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| RpcError::registry(format!("etcd watch: {}", e)))?;
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            // watcher 随任务存活；接收端被丢弃（本轮退役）或流掉线
            // 都立即结束任务，释放服务端的 watch 流
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    msg = stream.message() => match msg {
                        Ok(Some(_resp)) => {
                            let _ = tx.try_send(());
                        }
                        Ok(None) => return,
                        Err(e) => {
                            warn!(error = %e, "etcd watch stream error");
                            return;
                        }
                    }
                }
            }
        });

        Ok((members, MembershipEvents::new(rx)))
    }

    async fn register(&self, member: &Member) -> Result<String> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(self.ttl, None)
            .await
            .map_err(|e| RpcError::registry(format!("etcd lease grant: {}", e)))?;
        let lease_id = lease.id();
        let key = self.node_key(lease_id);
        let value = serde_json::to_string(member)?;
        client
            .put(
                key.clone(),
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await
            .map_err(|e| RpcError::registry(format!("etcd put: {}", e)))?;
        info!(key = %key, addr = %member.addr, weight = member.weight, "member registered");

        let keep_alive = tokio::spawn(keep_alive_loop(self.client.clone(), lease_id, self.ttl));
        self.registrations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.clone(), Registration {
                lease_id,
                keep_alive,
            });
        Ok(key)
    }

    async fn deregister(&self, handle: &str) -> Result<()> {
        let registration = self
            .registrations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(handle);
        let Some(registration) = registration else {
            return Ok(());
        };
        registration.keep_alive.abort();

        let mut client = self.client.clone();
        client
            .delete(handle.to_string(), None)
            .await
            .map_err(|e| RpcError::registry(format!("etcd delete: {}", e)))?;
        let _ = client.lease_revoke(registration.lease_id).await;
        info!(key = %handle, "member deregistered");
        Ok(())
    }
}

/// 租约续约任务，按 ttl/3 的节奏续约直到被中止或出错
async fn keep_alive_loop(client: Client, lease_id: i64, ttl: i64) {
    let mut client = client;
    let (mut keeper, mut stream) = match client.lease_keep_alive(lease_id).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(lease_id, error = %e, "lease keep-alive setup failed");
            return;
        }
    };
    let period = Duration::from_secs((ttl as u64 / 3).max(1));
    loop {
        tokio::time::sleep(period).await;
        if let Err(e) = keeper.keep_alive().await {
            error!(lease_id, error = %e, "lease keep-alive failed");
            return;
        }
        match stream.message().await {
            Ok(Some(_resp)) => {}
            Ok(None) => return,
            Err(e) => {
                error!(lease_id, error = %e, "lease keep-alive stream error");
                return;
            }
        }
    }
}

impl Drop for EtcdRegistry {
    fn drop(&mut self) {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for registration in registrations.values() {
            registration.keep_alive.abort();
        }
        registrations.clear();
    }
}
