//! 滑动窗口熔断器测试
//!
//! 熔断器基于真实时钟，测试里把窗口与休眠时长压缩到几百毫秒。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::sleep;
use std::time::Duration;

use flare_rpc_core::config::BreakerConfig;
use flare_rpc_core::{Breaker, BreakerState};

fn test_config() -> BreakerConfig {
    BreakerConfig {
        window_ms: 400,
        buckets: 4,
        ratio: 0.5,
        min_requests: 10,
        sleep_ms: 100,
    }
}

/// 测试：空窗口时放行
#[test]
fn test_closed_allows() {
    let breaker = Breaker::new(&test_config());
    assert!(breaker.allow());
    assert_eq!(breaker.state(), BreakerState::Closed);
}

/// 测试：请求数与失败率同时越限后打开
#[test]
fn test_opens_after_failures() {
    let breaker = Breaker::new(&test_config());
    for _ in 0..9 {
        breaker.fail();
    }
    // 请求数未达 min_requests，仍然放行
    assert!(breaker.allow());
    breaker.fail();
    // 10 次全失败，打开熔断；刚打开时休眠期未过，不放行
    assert!(!breaker.allow());
    assert_eq!(breaker.state(), BreakerState::Open);
}

/// 测试：失败率低于阈值不打开
#[test]
fn test_stays_closed_below_ratio() {
    let breaker = Breaker::new(&test_config());
    for _ in 0..8 {
        breaker.success();
    }
    for _ in 0..4 {
        breaker.fail();
    }
    // 12 次请求中 4 次失败，失败率 1/3 < 0.5
    assert!(breaker.allow());
    assert_eq!(breaker.state(), BreakerState::Closed);
}

/// 测试：打开后每个休眠周期只放行一个探测请求
#[test]
fn test_single_probe_per_sleep() {
    let breaker = Breaker::new(&test_config());
    for _ in 0..10 {
        breaker.fail();
    }
    assert!(!breaker.allow());

    sleep(Duration::from_millis(150));
    let allowed: usize = (0..8).filter(|_| breaker.allow()).count();
    assert_eq!(allowed, 1, "exactly one probe per sleep period");

    // 下一个休眠周期再放行一个
    sleep(Duration::from_millis(150));
    let allowed: usize = (0..8).filter(|_| breaker.allow()).count();
    assert_eq!(allowed, 1);
}

/// 测试：探测成功后恢复并清空窗口
#[test]
fn test_probe_success_resets() {
    let breaker = Breaker::new(&test_config());
    for _ in 0..10 {
        breaker.fail();
    }
    assert!(!breaker.allow());

    sleep(Duration::from_millis(150));
    assert!(breaker.allow());
    breaker.success();

    assert_eq!(breaker.state(), BreakerState::Closed);
    // 窗口已清空，旧失败不再计入
    assert!(breaker.allow());
}

/// 测试：窗口滑过后旧失败被丢弃
#[test]
fn test_window_expires_old_failures() {
    let cfg = BreakerConfig {
        min_requests: 5,
        ..test_config()
    };
    let breaker = Breaker::new(&cfg);
    for _ in 0..4 {
        breaker.fail();
    }
    sleep(Duration::from_millis(500));
    // 推进桶环，滑出窗口的桶被重置
    breaker.success();
    assert!(breaker.allow());
    assert_eq!(breaker.state(), BreakerState::Closed);
}

/// 测试：状态变化回调在打开与恢复时各触发一次
#[test]
fn test_state_callback() {
    let transitions = Arc::new(AtomicUsize::new(0));
    let counter = transitions.clone();
    let breaker = Breaker::new(&test_config())
        .on_state_change(Box::new(move |_s| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

    for _ in 0..10 {
        breaker.fail();
    }
    assert!(!breaker.allow());
    assert_eq!(transitions.load(Ordering::SeqCst), 1);

    sleep(Duration::from_millis(150));
    assert!(breaker.allow());
    breaker.success();
    assert_eq!(transitions.load(Ordering::SeqCst), 2);
}
