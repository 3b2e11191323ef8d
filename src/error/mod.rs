//! RPC 错误处理模块
//!
//! 提供统一的错误类型，覆盖传输、协议、超时、熔断与发现各类失败

use thiserror::Error;

/// RPC 统一错误类型
///
/// 前四个变体是稳定的哨兵错误，调用方可以直接匹配；
/// 其余变体携带具体原因。
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// 连接已关闭（本端 Close 或远端断开）
    #[error("connection is shut down")]
    Shutdown,

    /// 调用超时（仅本端放弃等待，在途请求不会被取消）
    #[error("rpc call timeout")]
    Timeout,

    /// 熔断器拒绝（未触网即失败）
    #[error("breaker not allowed")]
    Breaker,

    /// 当前没有可用的 rpc 客户端
    #[error("no rpc client")]
    NoClient,

    /// 连接在响应中途意外断开
    #[error("unexpected eof")]
    UnexpectedEof,

    /// 远端方法返回的业务错误字符串
    #[error("server error: {0}")]
    Server(String),

    /// 编解码错误
    #[error("codec error: {0}")]
    Codec(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(String),

    /// 注册中心错误
    #[error("registry error: {0}")]
    Registry(String),
}

impl RpcError {
    /// 是否属于连接存活性失败
    ///
    /// ping 循环据此决定是否重拨，熔断上报据此决定是否计为失败。
    pub fn is_liveness(&self) -> bool {
        matches!(
            self,
            RpcError::Shutdown | RpcError::Timeout | RpcError::UnexpectedEof
        )
    }

    /// 创建注册中心错误
    pub fn registry(msg: impl Into<String>) -> Self {
        RpcError::Registry(msg.into())
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            RpcError::UnexpectedEof
        } else {
            RpcError::Io(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, RpcError>;
