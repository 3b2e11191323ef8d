//! 服务发现客户端测试
//!
//! 用进程内注册中心驱动同步循环，验证池的重建、兜底回退与成员变更。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flare_rpc_core::config::{BalancePolicy, ClientConfig, ClusterConfig, ServerConfig};
use flare_rpc_core::registry::{Member, MembershipEvents, Registry, filter_members};
use flare_rpc_core::{ClusterClient, Result, RpcError, RpcServer, Shard};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// 进程内注册中心，set_members 变更成员并通知所有监听者
struct MockRegistry {
    members: Mutex<Vec<Member>>,
    notifiers: Mutex<Vec<mpsc::Sender<()>>>,
}

impl MockRegistry {
    fn new(members: Vec<Member>) -> Arc<Self> {
        Arc::new(Self {
            members: Mutex::new(members),
            notifiers: Mutex::new(Vec::new()),
        })
    }

    fn set_members(&self, members: Vec<Member>) {
        *self.members.lock().unwrap() = members;
        for tx in self.notifiers.lock().unwrap().iter() {
            let _ = tx.try_send(());
        }
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn watch_members(&self, group: Option<&str>) -> Result<(Vec<Member>, MembershipEvents)> {
        let members = filter_members(self.members.lock().unwrap().clone(), group);
        let (tx, rx) = mpsc::channel(1);
        self.notifiers.lock().unwrap().push(tx);
        Ok((members, MembershipEvents::new(rx)))
    }

    async fn register(&self, member: &Member) -> Result<String> {
        let mut members = self.members.lock().unwrap();
        members.push(member.clone());
        Ok(member.key())
    }

    async fn deregister(&self, handle: &str) -> Result<()> {
        self.members.lock().unwrap().retain(|m| m.key() != handle);
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_tagged_server(tag: &str) -> (Arc<RpcServer>, String) {
    init_tracing();
    let server = RpcServer::new(ServerConfig {
        proto: "tcp".to_string(),
        addr: "127.0.0.1:0".to_string(),
        weight: 1,
        group: None,
        idle_timeout_ms: 60_000,
    });
    let tag = tag.to_string();
    server.register_method("which", move |_: serde_json::Value| {
        let tag = tag.clone();
        async move { Ok::<_, String>(tag) }
    });
    let addr = server.serve().await.expect("serve").to_string();
    (server, addr)
}

fn cluster_config() -> ClusterConfig {
    ClusterConfig {
        policy: BalancePolicy::Weighted,
        group: None,
        pull_interval_ms: 200,
        client: ClientConfig {
            proto: "tcp".to_string(),
            addr: String::new(),
            timeout_ms: 100,
            dial_timeout_ms: 500,
            breaker: None,
        },
        backup: None,
    }
}

/// 等待发现池就绪，满足断言条件后返回
async fn wait_for_balancer<F>(cluster: &ClusterClient, cond: F)
where
    F: Fn(&flare_rpc_core::Balancer) -> bool,
{
    for _ in 0..50 {
        if let Some(balancer) = cluster.balancer() {
            if cond(&balancer) {
                return;
            }
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("balancer did not reach expected state");
}

/// 测试：同步循环发布发现池并可完成调用
#[tokio::test]
async fn test_discovery_publishes_pool() {
    let (_sa, addr_a) = start_tagged_server("a").await;
    let (_sb, addr_b) = start_tagged_server("b").await;
    let registry = MockRegistry::new(vec![
        Member::new(addr_a.clone(), 1),
        Member::new(addr_b.clone(), 1),
    ]);

    let cluster = ClusterClient::new(cluster_config(), registry).await;
    wait_for_balancer(&cluster, |b| b.servers() == 2).await;

    let tag: String = cluster
        .call("which", &json!(null), Shard::None)
        .await
        .expect("call");
    assert!(tag == "a" || tag == "b");
    cluster.close();
}

/// 测试：权重按轮转交错展开，槽位顺序可复现
#[tokio::test]
async fn test_weighted_interleave() {
    let (_sa, addr_a) = start_tagged_server("a").await;
    let (_sb, addr_b) = start_tagged_server("b").await;
    let registry = MockRegistry::new(vec![
        Member::new(addr_a.clone(), 3),
        Member::new(addr_b.clone(), 1),
    ]);

    let cluster = ClusterClient::new(cluster_config(), registry).await;
    wait_for_balancer(&cluster, |b| b.weight() == 4).await;

    let balancer = cluster.balancer().expect("balancer");
    assert_eq!(balancer.servers(), 2);
    assert_eq!(
        balancer.endpoints(),
        vec![
            addr_a.clone(),
            addr_b.clone(),
            addr_a.clone(),
            addr_a.clone()
        ]
    );
    cluster.close();
}

/// 测试：成员变更通知触发重建，退役成员从池中消失
#[tokio::test]
async fn test_membership_change_rebuilds_pool() {
    let (_sa, addr_a) = start_tagged_server("a").await;
    let (_sb, addr_b) = start_tagged_server("b").await;
    let registry = MockRegistry::new(vec![
        Member::new(addr_a.clone(), 1),
        Member::new(addr_b.clone(), 1),
    ]);

    let cluster = ClusterClient::new(cluster_config(), registry.clone()).await;
    wait_for_balancer(&cluster, |b| b.servers() == 2).await;

    registry.set_members(vec![Member::new(addr_a.clone(), 1)]);
    wait_for_balancer(&cluster, |b| b.servers() == 1).await;

    for _ in 0..4 {
        let tag: String = cluster
            .call("which", &json!(null), Shard::None)
            .await
            .expect("call");
        assert_eq!(tag, "a");
    }
    cluster.close();
}

/// 测试：同一成员列表重复同步，池的槽位顺序与总权重不漂移
#[tokio::test]
async fn test_rebuild_is_idempotent() {
    let (_sa, addr_a) = start_tagged_server("a").await;
    let (_sb, addr_b) = start_tagged_server("b").await;
    let registry = MockRegistry::new(vec![
        Member::new(addr_a.clone(), 3),
        Member::new(addr_b.clone(), 1),
    ]);

    let cluster = ClusterClient::new(cluster_config(), registry).await;
    wait_for_balancer(&cluster, |b| b.weight() == 4).await;
    let first = cluster.balancer().expect("balancer");
    let endpoints = first.endpoints();

    // 等待若干个拉取周期，后续同步轮会重新发布快照
    sleep(Duration::from_millis(700)).await;
    let rebuilt = cluster.balancer().expect("balancer");
    assert_eq!(rebuilt.weight(), 4);
    assert_eq!(rebuilt.servers(), 2);
    assert_eq!(rebuilt.endpoints(), endpoints);
    cluster.close();
}

/// 测试：退役成员在宽限期内仍可服务旧快照上的在途调用
#[tokio::test]
async fn test_retired_member_grace_period() {
    let (_sa, addr_a) = start_tagged_server("a").await;
    let (_sb, addr_b) = start_tagged_server("b").await;
    let registry = MockRegistry::new(vec![
        Member::new(addr_a.clone(), 1),
        Member::new(addr_b.clone(), 1),
    ]);

    let cluster = ClusterClient::new(cluster_config(), registry.clone()).await;
    wait_for_balancer(&cluster, |b| b.servers() == 2).await;
    let old = cluster.balancer().expect("balancer");

    registry.set_members(vec![Member::new(addr_a.clone(), 1)]);
    wait_for_balancer(&cluster, |b| b.servers() == 1).await;

    // 新快照已发布，旧快照里的退役成员在两倍超时的宽限期内仍可用
    let mut tags = std::collections::HashSet::new();
    for _ in 0..2 {
        let tag: String = old
            .call("which", &json!(null), Shard::None)
            .await
            .expect("call on old snapshot");
        tags.insert(tag);
    }
    assert!(tags.contains("b"), "retired member must stay usable in grace");

    // 宽限期（2 × 100ms 超时）过后退役成员被关闭，轮询跳到存活成员
    sleep(Duration::from_millis(800)).await;
    for _ in 0..2 {
        let tag: String = old
            .call("which", &json!(null), Shard::None)
            .await
            .expect("call after grace");
        assert_eq!(tag, "a");
    }
    cluster.close();
}

/// 测试：权重为 0 的成员不参与选择
#[tokio::test]
async fn test_zero_weight_member_excluded() {
    let (_sa, addr_a) = start_tagged_server("a").await;
    let (_sb, addr_b) = start_tagged_server("b").await;
    let registry = MockRegistry::new(vec![
        Member::new(addr_a.clone(), 1),
        Member::new(addr_b.clone(), 0),
    ]);

    let cluster = ClusterClient::new(cluster_config(), registry).await;
    wait_for_balancer(&cluster, |b| b.servers() == 1).await;

    let tag: String = cluster
        .call("which", &json!(null), Shard::None)
        .await
        .expect("call");
    assert_eq!(tag, "a");
    cluster.close();
}

/// 测试：分组过滤只保留同组与未分组成员
#[tokio::test]
async fn test_group_filter() {
    let (_sa, addr_a) = start_tagged_server("a").await;
    let (_sb, addr_b) = start_tagged_server("b").await;
    let registry = MockRegistry::new(vec![
        Member::new(addr_a.clone(), 1).with_group("read"),
        Member::new(addr_b.clone(), 1).with_group("write"),
    ]);

    let mut cfg = cluster_config();
    cfg.group = Some("read".to_string());
    let cluster = ClusterClient::new(cfg, registry).await;
    wait_for_balancer(&cluster, |b| b.servers() == 1).await;

    let tag: String = cluster
        .call("which", &json!(null), Shard::None)
        .await
        .expect("call");
    assert_eq!(tag, "a");
    cluster.close();
}

/// 测试：发现池无可用目标时回退到静态兜底池
#[tokio::test]
async fn test_backup_fallback() {
    let (_backup_server, backup_addr) = start_tagged_server("backup").await;
    let registry = MockRegistry::new(Vec::new());

    let mut cfg = cluster_config();
    cfg.backup = Some(vec![ClientConfig::new(backup_addr)]);
    let cluster = ClusterClient::new(cfg, registry).await;

    // 成员列表为空，发现池永远不会发布
    sleep(Duration::from_millis(300)).await;
    assert!(cluster.balancer().is_none());

    let tag: String = cluster
        .call("which", &json!(null), Shard::None)
        .await
        .expect("call");
    assert_eq!(tag, "backup");
    cluster.close();
}

/// 测试：既无发现池也无兜底池时返回 NoClient
#[tokio::test]
async fn test_no_pool_no_backup() {
    let registry = MockRegistry::new(Vec::new());
    let cluster = ClusterClient::new(cluster_config(), registry).await;

    let err = cluster
        .call::<_, String>("which", &json!(null), Shard::None)
        .await
        .expect_err("must fail");
    assert!(matches!(err, RpcError::NoClient));
    cluster.close();
}

/// 测试：成员清空后旧池延迟关闭，调用落到兜底池
#[tokio::test]
async fn test_drain_to_backup_on_empty_members() {
    let (_sa, addr_a) = start_tagged_server("a").await;
    let (_backup_server, backup_addr) = start_tagged_server("backup").await;
    let registry = MockRegistry::new(vec![Member::new(addr_a.clone(), 1)]);

    let mut cfg = cluster_config();
    cfg.backup = Some(vec![ClientConfig::new(backup_addr)]);
    let cluster = ClusterClient::new(cfg, registry.clone()).await;
    wait_for_balancer(&cluster, |b| b.servers() == 1).await;

    registry.set_members(Vec::new());
    // 等待退役成员的宽限期（两倍调用超时）过去、旧连接被关闭
    sleep(Duration::from_millis(1_500)).await;

    let tag: String = cluster
        .call("which", &json!(null), Shard::None)
        .await
        .expect("call");
    assert_eq!(tag, "backup");
    cluster.close();
}
