//! 单连接 RPC 客户端
//!
//! 一条物理连接上用序列号复用并发调用：发送侧注册 seq → 完成通道，
//! 专属读取任务按响应头中的 seq 回投结果。连接终止时，所有仍在途的
//! 调用恰好收到一次终止错误。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::codec::{self, FrameRead, FrameWrite, RequestHeader, ResponseHeader, SharedCodec};
use crate::error::{Result, RpcError};
use crate::trace::TraceContext;

/// 响应体的完成通道，Err 携带服务端错误或终止错误
type Completion = oneshot::Sender<Result<Bytes>>;

type PendingMap = Mutex<HashMap<u64, Completion>>;

fn lock_pending(p: &PendingMap) -> MutexGuard<'_, HashMap<u64, Completion>> {
    p.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 一条到远端的物理连接
///
/// 可被多个任务并发使用；调用 [`Connection::close`] 或远端断开后，
/// 后续与在途的调用都会收到 [`RpcError::Shutdown`] 类错误。
pub struct Connection {
    codec: SharedCodec,
    seq: AtomicU64,
    pending: Arc<PendingMap>,
    /// 本端主动关闭
    closing: Arc<AtomicBool>,
    /// 读取任务已退出
    shutdown: Arc<AtomicBool>,
    writer: tokio::sync::Mutex<FrameWrite<OwnedWriteHalf>>,
    remote_addr: String,
    cancel: CancellationToken,
}

impl Connection {
    /// 建立到远端的连接
    pub async fn dial(
        proto: &str,
        addr: &str,
        dial_timeout: Duration,
        codec: SharedCodec,
    ) -> Result<Arc<Self>> {
        if proto != "tcp" {
            return Err(RpcError::Io(format!("unsupported proto: {}", proto)));
        }
        let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, codec, addr.to_string()))
    }

    /// 从已建立的流创建连接并启动读取任务
    pub fn from_stream(stream: TcpStream, codec: SharedCodec, remote_addr: String) -> Arc<Self> {
        let (rd, wr) = stream.into_split();
        let conn = Arc::new(Self {
            codec: codec.clone(),
            seq: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            closing: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            writer: tokio::sync::Mutex::new(codec::frame_write(wr)),
            remote_addr,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(read_loop(
            codec::frame_read(rd),
            codec,
            conn.pending.clone(),
            conn.shutdown.clone(),
            conn.closing.clone(),
            conn.cancel.clone(),
            conn.remote_addr.clone(),
        ));
        conn
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire) || self.closing.load(Ordering::Acquire)
    }

    /// 注册调用并写出请求，返回完成通道
    ///
    /// 头帧与体帧在持有写锁期间一并写出。编码或写入失败时同步返回错误，
    /// 此时调用不会留在在途表里。
    pub async fn send(
        &self,
        method: &str,
        body: Bytes,
        trace: Option<TraceContext>,
    ) -> Result<oneshot::Receiver<Result<Bytes>>> {
        if self.is_shutdown() {
            return Err(RpcError::Shutdown);
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let header = RequestHeader {
            seq,
            method: method.to_string(),
            trace,
        };
        let header_bytes = codec::encode_payload(&*self.codec, &header)?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(seq, tx);

        let res: Result<()> = async {
            let mut writer = self.writer.lock().await;
            writer.feed(header_bytes).await?;
            writer.feed(body).await?;
            writer.flush().await?;
            Ok(())
        }
        .await;
        if let Err(err) = res {
            lock_pending(&self.pending).remove(&seq);
            return Err(err);
        }
        // 读取任务可能在注册与写出之间终止并清空在途表；此时自己的
        // 条目已无人投递，取回后就地以 Shutdown 终结。remove 落空说明
        // 读取任务已经投递过终止错误。
        if self.shutdown.load(Ordering::Acquire)
            && lock_pending(&self.pending).remove(&seq).is_some()
        {
            return Err(RpcError::Shutdown);
        }
        Ok(rx)
    }

    /// 发起调用并等待响应或超时
    ///
    /// 超时只解除本端等待，不取消在途请求；迟到的响应会被读取任务
    /// 正常取出并投入已被放弃的完成通道后丢弃。
    pub async fn call(&self, method: &str, body: Bytes, timeout: Duration) -> Result<Bytes> {
        let rx = self.send(method, body, None).await?;
        tokio::select! {
            r = rx => match r {
                Ok(result) => result,
                Err(_) => Err(RpcError::Shutdown),
            },
            _ = tokio::time::sleep(timeout) => Err(RpcError::Timeout),
        }
    }

    /// 关闭连接
    ///
    /// 重复关闭返回 [`RpcError::Shutdown`]。
    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Err(RpcError::Shutdown);
        }
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
        Ok(())
    }
}

/// 专属读取任务
///
/// 逐个读取「响应头帧 + 体帧」，按 seq 取出在途调用投递结果；
/// 在途表中找不到的序号直接丢弃响应体。任意读取/解码失败都会
/// 终止本连接，并把终止错误投递给所有仍在途的调用。
async fn read_loop(
    mut reader: FrameRead<OwnedReadHalf>,
    codec: SharedCodec,
    pending: Arc<PendingMap>,
    shutdown: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    cancel: CancellationToken,
    remote_addr: String,
) {
    let err = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break RpcError::Shutdown,
            f = reader.next() => f,
        };
        let frame = match frame {
            Some(Ok(b)) => b,
            Some(Err(e)) => break RpcError::from(e),
            None => break RpcError::UnexpectedEof,
        };
        let header: ResponseHeader = match codec::decode_payload(&*codec, &frame) {
            Ok(h) => h,
            Err(e) => break e,
        };
        let body = tokio::select! {
            _ = cancel.cancelled() => break RpcError::Shutdown,
            f = reader.next() => match f {
                Some(Ok(b)) => b,
                Some(Err(e)) => break RpcError::from(e),
                None => break RpcError::UnexpectedEof,
            },
        };
        match lock_pending(&pending).remove(&header.seq) {
            Some(tx) => {
                let result = if header.error.is_empty() {
                    Ok(body.freeze())
                } else {
                    Err(RpcError::Server(header.error))
                };
                // 调用方可能已超时放弃，投递失败直接丢弃
                let _ = tx.send(result);
            }
            None => {
                // 写请求失败时已被移除，响应体读出后丢弃
                debug!(seq = header.seq, addr = %remote_addr, "discard response with no pending call");
            }
        }
    };

    shutdown.store(true, Ordering::Release);
    let err = if closing.load(Ordering::Acquire) && err.is_liveness() {
        RpcError::Shutdown
    } else {
        err
    };
    let drained: Vec<Completion> = {
        let mut map = lock_pending(&pending);
        map.drain().map(|(_, tx)| tx).collect()
    };
    for tx in drained {
        let _ = tx.send(Err(err.clone()));
    }
    if !matches!(err, RpcError::Shutdown) {
        error!(addr = %remote_addr, error = %err, "rpc connection terminated");
    }
}
