//! 注册中心协作方
//!
//! 提供「拉取当前成员 + 变更通知 + 临时注册/注销」三个能力的统一
//! trait。成员以 JSON 编码的临时节点形式存放，进程断开后自动消失。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

#[cfg(feature = "discovery")]
pub mod etcd;

/// 注册中心里的一个服务成员
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// 地址 host:port
    pub addr: String,
    /// 传输协议
    #[serde(default = "default_member_proto")]
    pub proto: String,
    /// 负载权重，0 表示不参与选择
    #[serde(default)]
    pub weight: u32,
    /// 分组标签
    #[serde(default)]
    pub group: Option<String>,
}

fn default_member_proto() -> String {
    "tcp".to_string()
}

impl Member {
    pub fn new(addr: impl Into<String>, weight: u32) -> Self {
        Self {
            addr: addr.into(),
            proto: default_member_proto(),
            weight,
            group: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// 池内唯一键
    pub fn key(&self) -> String {
        format!("{}@{}", self.proto, self.addr)
    }
}

/// 过滤可用成员：权重为 0 的剔除；指定分组时只保留同组或未分组的成员
pub fn filter_members(members: Vec<Member>, group: Option<&str>) -> Vec<Member> {
    members
        .into_iter()
        .filter(|m| {
            m.weight > 0
                && match (group, m.group.as_deref()) {
                    (None, _) | (_, None) => true,
                    (Some(want), Some(has)) => want == has,
                }
        })
        .collect()
}

/// 成员变更通知
///
/// 一次 [`Registry::watch_members`] 返回一个通知句柄；
/// 通知只表示「有变化」，具体差异由下一轮全量拉取计算。
pub struct MembershipEvents {
    rx: mpsc::Receiver<()>,
}

impl MembershipEvents {
    pub fn new(rx: mpsc::Receiver<()>) -> Self {
        Self { rx }
    }

    /// 等待下一次变更；通知源关闭后永远挂起，由轮询间隔兜底
    pub async fn changed(&mut self) {
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

/// 注册中心
#[async_trait]
pub trait Registry: Send + Sync {
    /// 拉取当前成员列表并建立变更通知
    ///
    /// 返回的成员已按组过滤且权重大于 0。
    async fn watch_members(&self, group: Option<&str>) -> Result<(Vec<Member>, MembershipEvents)>;

    /// 注册临时成员，返回注销句柄
    async fn register(&self, member: &Member) -> Result<String>;

    /// 按句柄注销成员
    async fn deregister(&self, handle: &str) -> Result<()>;
}

/// 共享的注册中心句柄
pub type SharedRegistry = Arc<dyn Registry>;
