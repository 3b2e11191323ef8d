//! 可重连的 RPC 客户端包装
//!
//! 持有一个可替换的 [`Connection`]，后台 ping 循环负责探活与重拨；
//! 方法级熔断器与超时覆盖以不可变快照的形式供热路径无锁读取，
//! 由单一更新任务消费更新队列后整体重新发布。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::breaker::Breaker;
use crate::codec::{self, JsonCodec, PING_METHOD, SharedCodec};
use crate::config::{BreakerConfig, ClientConfig};
use crate::connection::Connection;
use crate::error::{Result, RpcError};
use crate::stat::SharedStat;
use crate::trace::SharedTrace;

/// 追踪里标识本组件的 family 名
const FAMILY: &str = "rpc_client";

/// ping 固定间隔
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// 更新队列容量
const UPDATE_QUEUE: usize = 10;

type BreakerMap = Arc<HashMap<String, Arc<Breaker>>>;
type TimeoutMap = Arc<HashMap<String, Duration>>;

enum Update {
    /// 首次调用某方法时惰性创建它的熔断器
    EnsureBreaker(String),
    MethodTimeout(String, Duration),
}

/// 可重连的 RPC 客户端
///
/// ping 失败（存活性错误）后把连接快照置空，并发调用立即得到
/// [`RpcError::NoClient`]，直至重拨成功。
pub struct Client {
    cfg: ClientConfig,
    codec: SharedCodec,
    /// 基础超时（毫秒），SetTimeout 可在线修改
    base_timeout: Arc<AtomicU64>,
    conn_rx: watch::Receiver<Option<Arc<Connection>>>,
    breakers_rx: watch::Receiver<BreakerMap>,
    timeouts_rx: watch::Receiver<TimeoutMap>,
    update_tx: mpsc::Sender<Update>,
    quit: CancellationToken,
    stats: Option<SharedStat>,
    tracer: Option<SharedTrace>,
}

impl Client {
    /// 拨号并启动后台任务
    ///
    /// 与原始实现一致：首次拨号失败不报错，由 ping 循环持续重试。
    pub async fn dial(cfg: ClientConfig) -> Self {
        Self::dial_with(cfg, Arc::new(JsonCodec), None, None).await
    }

    /// 指定编解码器与可观测性协作方的完整构造
    pub async fn dial_with(
        cfg: ClientConfig,
        codec: SharedCodec,
        stats: Option<SharedStat>,
        tracer: Option<SharedTrace>,
    ) -> Self {
        let initial =
            match Connection::dial(&cfg.proto, &cfg.addr, cfg.dial_timeout(), codec.clone()).await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    error!(proto = %cfg.proto, addr = %cfg.addr, error = %e, "dial failed");
                    None
                }
            };
        let base_timeout = Arc::new(AtomicU64::new(cfg.timeout_ms));
        let (conn_tx, conn_rx) = watch::channel(initial);
        let (breakers_tx, breakers_rx) = watch::channel(BreakerMap::default());
        let (timeouts_tx, timeouts_rx) = watch::channel(TimeoutMap::default());
        let (update_tx, update_rx) = mpsc::channel(UPDATE_QUEUE);
        let quit = CancellationToken::new();

        tokio::spawn(ping_loop(
            cfg.clone(),
            codec.clone(),
            conn_tx,
            base_timeout.clone(),
            quit.clone(),
        ));
        tokio::spawn(update_loop(
            cfg.breaker.clone(),
            stats.clone(),
            update_rx,
            breakers_tx,
            timeouts_tx,
            quit.clone(),
        ));

        Self {
            cfg,
            codec,
            base_timeout,
            conn_rx,
            breakers_rx,
            timeouts_rx,
            update_tx,
            quit,
            stats,
            tracer,
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.cfg.addr
    }

    /// 调用远端方法并等待完成
    ///
    /// 先解析方法级超时与熔断器；熔断拒绝时不触网直接失败。
    /// 调用结果按存活性分类上报熔断器：Shutdown/Timeout/UnexpectedEof
    /// 计为失败，其余（包括服务端业务错误）计为成功。
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let conn = match self.conn_rx.borrow().clone() {
            Some(conn) => conn,
            None => return Err(RpcError::NoClient),
        };
        let mut span = self
            .tracer
            .as_ref()
            .map(|t| t.fork(FAMILY, method, conn.remote_addr()));
        let trace_ctx = span.as_mut().map(|s| {
            s.client("");
            s.context()
        });

        // 熔断器：首次调用的方法经更新队列惰性创建
        let mut breaker = None;
        if self.cfg.breaker.is_some() {
            breaker = self.breakers_rx.borrow().get(method).cloned();
            match &breaker {
                Some(b) => {
                    if !b.allow() {
                        let err = RpcError::Breaker;
                        if let Some(s) = span.as_mut() {
                            s.done(Some(&err));
                        }
                        return Err(err);
                    }
                }
                None => {
                    let _ = self.update_tx.try_send(Update::EnsureBreaker(method.to_string()));
                }
            }
        }

        let start = Instant::now();
        let timeout = self
            .timeouts_rx
            .borrow()
            .get(method)
            .copied()
            .unwrap_or_else(|| self.base_timeout());

        let result: Result<Bytes> = match codec::encode_payload(&*self.codec, args) {
            Err(e) => Err(e),
            Ok(body) => match conn.send(method, body, trace_ctx).await {
                Err(e) => Err(e),
                Ok(rx) => tokio::select! {
                    r = rx => r.unwrap_or(Err(RpcError::Shutdown)),
                    _ = tokio::time::sleep(timeout) => Err(RpcError::Timeout),
                },
            },
        };

        if let Some(b) = &breaker {
            match &result {
                Err(e) if e.is_liveness() => b.fail(),
                _ => b.success(),
            }
        }
        if let Some(stats) = &self.stats {
            stats.timing(method, start.elapsed().as_millis() as i64);
        }

        let reply = result.and_then(|bytes| codec::decode_payload(&*self.codec, &bytes));
        if let Some(s) = span.as_mut() {
            s.done(reply.as_ref().err());
        }
        reply
    }

    /// 设置方法级超时覆盖
    pub async fn set_method_timeout(&self, method: &str, timeout: Duration) {
        let _ = self
            .update_tx
            .send(Update::MethodTimeout(method.to_string(), timeout))
            .await;
    }

    /// 设置基础超时
    pub fn set_timeout(&self, timeout: Duration) {
        self.base_timeout
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout.load(Ordering::Relaxed))
    }

    /// 关闭客户端，停止 ping 与更新任务并断开当前连接
    pub fn close(&self) {
        self.quit.cancel();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.quit.cancel();
    }
}

/// ping 循环：固定间隔探活，存活性失败后置空连接快照并重拨
async fn ping_loop(
    cfg: ClientConfig,
    codec: SharedCodec,
    conn_tx: watch::Sender<Option<Arc<Connection>>>,
    base_timeout: Arc<AtomicU64>,
    quit: CancellationToken,
) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut conn = conn_tx.borrow().clone();
    loop {
        tokio::select! {
            _ = quit.cancelled() => {
                conn_tx.send_replace(None);
                if let Some(c) = conn.take() {
                    let _ = c.close().await;
                }
                return;
            }
            _ = interval.tick() => {}
        }
        let current = match &conn {
            Some(c) if !c.is_shutdown() => c.clone(),
            _ => {
                match Connection::dial(&cfg.proto, &cfg.addr, cfg.dial_timeout(), codec.clone())
                    .await
                {
                    Ok(c) => {
                        conn = Some(c.clone());
                        conn_tx.send_replace(Some(c.clone()));
                        c
                    }
                    Err(e) => {
                        error!(proto = %cfg.proto, addr = %cfg.addr, error = %e, "dial failed");
                        continue;
                    }
                }
            }
        };
        let ping_body = match codec::encode_payload(&*codec, &()) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "encode ping payload failed");
                continue;
            }
        };
        let timeout = Duration::from_millis(base_timeout.load(Ordering::Relaxed));
        if let Err(e) = current.call(PING_METHOD, ping_body, timeout).await {
            error!(addr = %cfg.addr, error = %e, "ping failed");
            if e.is_liveness() {
                conn_tx.send_replace(None);
                let _ = current.close().await;
                conn = None;
            }
        }
    }
}

/// 单一更新任务：消费更新队列，重建并整体发布方法级快照
///
/// 写侧在此串行化，读侧始终看到完整的旧快照或完整的新快照。
async fn update_loop(
    breaker_cfg: Option<BreakerConfig>,
    stats: Option<SharedStat>,
    mut update_rx: mpsc::Receiver<Update>,
    breakers_tx: watch::Sender<BreakerMap>,
    timeouts_tx: watch::Sender<TimeoutMap>,
    quit: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = quit.cancelled() => return,
            u = update_rx.recv() => match u {
                Some(u) => u,
                None => return,
            },
        };
        match update {
            Update::EnsureBreaker(method) => {
                let Some(cfg) = &breaker_cfg else { continue };
                let cur = breakers_tx.borrow().clone();
                if cur.contains_key(&method) {
                    continue;
                }
                let mut breaker = Breaker::new(cfg);
                if let Some(stats) = stats.clone() {
                    let name = format!("breaker {}", method);
                    breaker =
                        breaker.on_state_change(Box::new(move |s| stats.state(&name, s as i64)));
                }
                let mut next: HashMap<_, _> = (*cur).clone();
                next.insert(method, Arc::new(breaker));
                breakers_tx.send_replace(Arc::new(next));
            }
            Update::MethodTimeout(method, timeout) => {
                let cur = timeouts_tx.borrow().clone();
                let mut next: HashMap<_, _> = (*cur).clone();
                next.insert(method, timeout);
                timeouts_tx.send_replace(Arc::new(next));
            }
        }
    }
}
