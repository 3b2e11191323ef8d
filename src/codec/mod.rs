//! 消息编解码模块
//!
//! 线上格式：每次调用的请求由「头帧 + 体帧」两个长度前缀帧组成，
//! 一次性写出；响应同样是「头帧 + 体帧」，错误响应的体帧为空。
//! 帧内字节布局由 [`MessageCodec`] 决定，默认实现为 JSON。

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::{Result, RpcError};
use crate::trace::TraceContext;

/// 保留的健康检查方法名，空入参、空出参
pub const PING_METHOD: &str = "inner.ping";

/// 请求头
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    pub seq: u64,
    pub method: String,
    /// 随请求传播的追踪上下文
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

/// 响应头，error 为空串表示成功
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub seq: u64,
    #[serde(default)]
    pub error: String,
}

/// 可插拔的消息编解码器
///
/// 以 `serde_json::Value` 为中间表示保持对象安全，
/// 具体字节格式由实现决定。
pub trait MessageCodec: Send + Sync {
    fn encode(&self, value: &serde_json::Value) -> Result<Bytes>;

    fn decode(&self, buf: &[u8]) -> Result<serde_json::Value>;
}

/// 共享的编解码器句柄
pub type SharedCodec = Arc<dyn MessageCodec>;

/// 默认 JSON 编解码器
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, value: &serde_json::Value) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, buf: &[u8]) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(buf)?)
    }
}

/// 用编解码器序列化任意负载
pub fn encode_payload<T: Serialize>(codec: &dyn MessageCodec, value: &T) -> Result<Bytes> {
    let v = serde_json::to_value(value)?;
    codec.encode(&v)
}

/// 用编解码器反序列化任意负载
pub fn decode_payload<T: DeserializeOwned>(codec: &dyn MessageCodec, buf: &[u8]) -> Result<T> {
    let v = codec.decode(buf)?;
    serde_json::from_value(v).map_err(|e| RpcError::Codec(e.to_string()))
}

pub(crate) type FrameRead<R> = FramedRead<R, LengthDelimitedCodec>;
pub(crate) type FrameWrite<W> = FramedWrite<W, LengthDelimitedCodec>;

pub(crate) fn frame_read<R: AsyncRead>(io: R) -> FrameRead<R> {
    FramedRead::new(io, LengthDelimitedCodec::new())
}

pub(crate) fn frame_write<W: AsyncWrite>(io: W) -> FrameWrite<W> {
    FramedWrite::new(io, LengthDelimitedCodec::new())
}
