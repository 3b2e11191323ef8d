//! Flare RPC Core Library
//!
//! Provides a multiplexing RPC client stack: single-connection clients,
//! reconnecting clients with health checks and per-method circuit breakers,
//! weighted/sharded load balancing, and registry-driven service discovery
//! with a static backup fallback.

pub mod codec;
pub mod config;
pub mod error;
pub mod registry;
pub mod stat;
pub mod trace;

// RPC 基础功能模块
pub mod balancer;
pub mod breaker;
pub mod client;
pub mod cluster;
pub mod connection;
pub mod server;

// Re-exports
pub use balancer::{Balancer, Pool, Shard};
pub use breaker::{Breaker, BreakerState};
pub use client::Client;
pub use cluster::ClusterClient;
pub use codec::{JsonCodec, MessageCodec, PING_METHOD, RequestHeader, ResponseHeader, SharedCodec};
pub use config::{
    BalancePolicy, BreakerConfig, ClientConfig, ClusterConfig, Config, RegistryConfig, ServerConfig,
};
pub use connection::Connection;
pub use error::{Result, RpcError};
pub use registry::{Member, MembershipEvents, Registry, SharedRegistry, filter_members};
pub use server::RpcServer;
pub use stat::{SharedStat, Stat};
pub use trace::{SharedTrace, Span, Trace, TraceContext};

// etcd 注册中心（可选）
#[cfg(feature = "discovery")]
pub use registry::etcd::EtcdRegistry;
