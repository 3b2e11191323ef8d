//! RPC 服务端
//!
//! 与客户端说同一套帧协议：每个连接一个读取任务，逐调用派生处理
//! 任务，响应在持有写锁期间一并写出。内建保留的 ping 方法；
//! 可选择把自身作为临时成员注册进注册中心参与发现。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::codec::{
    self, FrameWrite, JsonCodec, PING_METHOD, RequestHeader, ResponseHeader, SharedCodec,
};
use crate::config::ServerConfig;
use crate::error::{Result, RpcError};
use crate::registry::{Member, SharedRegistry};

/// 方法处理器，出错时返回随响应头下发的错误字符串
type Handler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, std::result::Result<serde_json::Value, String>>
        + Send
        + Sync,
>;

type SharedWriter = Arc<tokio::sync::Mutex<FrameWrite<OwnedWriteHalf>>>;

/// RPC 服务端
pub struct RpcServer {
    cfg: ServerConfig,
    codec: SharedCodec,
    methods: RwLock<HashMap<String, Handler>>,
    quit: CancellationToken,
    registration: Mutex<Option<(SharedRegistry, String)>>,
}

impl RpcServer {
    pub fn new(cfg: ServerConfig) -> Arc<Self> {
        Self::with_codec(cfg, Arc::new(JsonCodec))
    }

    pub fn with_codec(cfg: ServerConfig, codec: SharedCodec) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            codec,
            methods: RwLock::new(HashMap::new()),
            quit: CancellationToken::new(),
            registration: Mutex::new(None),
        })
    }

    /// 注册一个方法处理器
    pub fn register_method<A, R, F, Fut>(&self, name: &str, f: F)
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |value| {
            let f = f.clone();
            Box::pin(async move {
                let args: A = serde_json::from_value(value)
                    .map_err(|e| format!("invalid argument: {}", e))?;
                let reply = f(args).await?;
                serde_json::to_value(reply).map_err(|e| format!("encode reply: {}", e))
            })
        });
        self.methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), handler);
    }

    /// 启动监听，返回实际绑定地址
    pub async fn serve(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.cfg.proto != "tcp" {
            return Err(RpcError::Io(format!(
                "unsupported proto: {}",
                self.cfg.proto
            )));
        }
        let listener = TcpListener::bind(&self.cfg.addr).await?;
        let addr = listener.local_addr()?;
        info!(addr = %addr, "rpc server listening");
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server.quit.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tokio::spawn(server.clone().serve_conn(stream, peer));
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
            }
        });
        Ok(addr)
    }

    /// 启动监听并把自身注册为注册中心的临时成员
    pub async fn serve_with_registry(
        self: &Arc<Self>,
        registry: SharedRegistry,
    ) -> Result<SocketAddr> {
        let addr = self.serve().await?;
        let mut member = Member::new(addr.to_string(), self.cfg.weight);
        member.proto = self.cfg.proto.clone();
        member.group = self.cfg.group.clone();
        let handle = registry.register(&member).await?;
        *self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((registry, handle));
        Ok(addr)
    }

    /// 停止接收新连接并注销注册中心成员
    pub async fn close(&self) {
        self.quit.cancel();
        let registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((registry, handle)) = registration {
            if let Err(e) = registry.deregister(&handle).await {
                error!(error = %e, "deregister failed");
            }
        }
    }

    async fn serve_conn(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            error!(peer = %peer, error = %e, "set_nodelay failed");
        }
        let (rd, wr) = stream.into_split();
        let mut reader = codec::frame_read(rd);
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(codec::frame_write(wr)));
        loop {
            let frame = tokio::select! {
                _ = self.quit.cancelled() => return,
                f = tokio::time::timeout(self.cfg.idle_timeout(), reader.next()) => match f {
                    Err(_) => {
                        info!(peer = %peer, "connection idle, closing");
                        return;
                    }
                    Ok(None) => return,
                    Ok(Some(Err(e))) => {
                        error!(peer = %peer, error = %e, "read request header failed");
                        return;
                    }
                    Ok(Some(Ok(b))) => b,
                }
            };
            let header: RequestHeader = match codec::decode_payload(&*self.codec, &frame) {
                Ok(h) => h,
                Err(e) => {
                    error!(peer = %peer, error = %e, "decode request header failed");
                    return;
                }
            };
            // 体帧同样受空闲超时与退出信号约束，发完头帧就停摆的
            // 对端不能占住连接任务
            let body = tokio::select! {
                _ = self.quit.cancelled() => return,
                f = tokio::time::timeout(self.cfg.idle_timeout(), reader.next()) => match f {
                    Err(_) => {
                        info!(peer = %peer, "connection idle, closing");
                        return;
                    }
                    Ok(Some(Ok(b))) => b.freeze(),
                    _ => return,
                }
            };
            tokio::spawn(self.clone().handle_call(writer.clone(), header, body));
        }
    }

    async fn handle_call(self: Arc<Self>, writer: SharedWriter, header: RequestHeader, body: Bytes) {
        let result: std::result::Result<serde_json::Value, String> =
            if header.method == PING_METHOD {
                Ok(serde_json::Value::Null)
            } else {
                let handler = self
                    .methods
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&header.method)
                    .cloned();
                match handler {
                    Some(handler) => match self.codec.decode(&body) {
                        Ok(value) => handler(value).await,
                        Err(e) => Err(format!("decode argument: {}", e)),
                    },
                    None => Err(format!("rpc: can't find method {}", header.method)),
                }
            };

        let (resp_header, resp_body) = match result {
            Ok(value) => {
                let body = match self.codec.encode(&value) {
                    Ok(b) => b,
                    Err(e) => {
                        error!(method = %header.method, error = %e, "encode reply failed");
                        return;
                    }
                };
                (
                    ResponseHeader {
                        seq: header.seq,
                        error: String::new(),
                    },
                    body,
                )
            }
            Err(message) => (
                ResponseHeader {
                    seq: header.seq,
                    error: message,
                },
                Bytes::new(),
            ),
        };
        let header_bytes = match codec::encode_payload(&*self.codec, &resp_header) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "encode response header failed");
                return;
            }
        };
        let mut writer = writer.lock().await;
        let written: Result<()> = async {
            writer.feed(header_bytes).await?;
            writer.feed(resp_body).await?;
            writer.flush().await?;
            Ok(())
        }
        .await;
        if let Err(e) = written {
            error!(error = %e, "write response failed");
        }
    }
}
