//! 链路追踪接口
//!
//! 核心只消费该接口，不提供实现。追踪器在构造时显式注入，
//! 不依赖任何进程级全局状态。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// 随请求头传播的追踪上下文
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    /// 是否采样
    pub sampled: bool,
}

/// 一次调用对应的追踪 span
pub trait Span: Send {
    /// 标记客户端发起，附带注解
    fn client(&mut self, annotation: &str);

    /// 取出需要随请求传播的上下文
    fn context(&self) -> TraceContext;

    /// 调用结束，err 为 None 表示成功
    fn done(&mut self, err: Option<&RpcError>);
}

/// 追踪器
pub trait Trace: Send + Sync {
    /// 派生一个子 span
    ///
    /// family 为组件名（如 "rpc_client"），title 为方法名，
    /// address 为远端地址。
    fn fork(&self, family: &str, title: &str, address: &str) -> Box<dyn Span>;
}

/// 共享的追踪器句柄
pub type SharedTrace = Arc<dyn Trace>;
