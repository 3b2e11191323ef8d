//! 滑动窗口熔断器
//!
//! 按目标方法统计最近一个窗口内的成功/失败，失败率越限后打开熔断，
//! 打开期间每隔 sleep 时长放行一个探测请求，探测成功则恢复。

use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::time::Instant;

use crate::config::BreakerConfig;

/// 熔断器状态
///
/// Open：请求不放行，休眠 sleep 时长后放行单个探测请求，
/// 探测成功则恢复为 Closed，否则保持 Open。
/// Closed：请求放行，统计失败率，请求数与失败率同时越限则转为 Open。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Open = 0,
    Closed = 1,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    success: u64,
    failure: u64,
}

impl Bucket {
    fn reset(&mut self) {
        self.success = 0;
        self.failure = 0;
    }
}

/// 时间桶环，覆盖一个完整窗口
struct Window {
    buckets: Vec<Bucket>,
    bucket_nanos: i64,
    last_access: Instant,
    cur: usize,
}

impl Window {
    fn new(cfg: &BreakerConfig) -> Self {
        let buckets = cfg.buckets.max(1);
        Self {
            buckets: vec![Bucket::default(); buckets],
            bucket_nanos: (cfg.window().as_nanos() as i64 / buckets as i64).max(1),
            last_access: Instant::now(),
            cur: 0,
        }
    }

    /// 惰性推进到当前时间桶，重置被跳过的桶
    fn last_bucket(&mut self) -> &mut Bucket {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_access).as_nanos() as i64;
        if elapsed > self.bucket_nanos {
            let mut steps = (elapsed / self.bucket_nanos) as usize;
            if steps > self.buckets.len() {
                steps = self.buckets.len();
            }
            for _ in 0..steps {
                self.cur = (self.cur + 1) % self.buckets.len();
                self.buckets[self.cur].reset();
            }
            self.last_access = now;
        }
        &mut self.buckets[self.cur]
    }

    /// 整个窗口的请求总数与失败率
    fn stat(&self) -> (u64, f32) {
        let mut total = 0u64;
        let mut fail = 0u64;
        for b in &self.buckets {
            total += b.success + b.failure;
            fail += b.failure;
        }
        if total == 0 {
            return (0, 0.0);
        }
        (total, fail as f32 / total as f32)
    }

    fn reset(&mut self) {
        for b in &mut self.buckets {
            b.reset();
        }
    }
}

/// 状态变化回调
pub type StateCallback = Box<dyn Fn(BreakerState) + Send + Sync>;

/// 滑动窗口熔断器
pub struct Breaker {
    window: Mutex<Window>,
    state: AtomicI32,
    /// 最近一次状态变化时刻，相对 created 的纳秒数，CAS 保证单探测
    last: AtomicI64,
    created: Instant,
    ratio: f32,
    min_requests: u64,
    sleep_nanos: i64,
    on_state: Option<StateCallback>,
}

impl Breaker {
    pub fn new(cfg: &BreakerConfig) -> Self {
        Self {
            window: Mutex::new(Window::new(cfg)),
            state: AtomicI32::new(BreakerState::Closed as i32),
            last: AtomicI64::new(0),
            created: Instant::now(),
            ratio: cfg.ratio,
            min_requests: cfg.min_requests,
            sleep_nanos: cfg.sleep().as_nanos() as i64,
            on_state: None,
        }
    }

    /// 设置状态变化回调
    pub fn on_state_change(mut self, f: StateCallback) -> Self {
        self.on_state = Some(f);
        self
    }

    /// 当前是否放行请求
    ///
    /// Open 状态下距上次状态变化超过 sleep 时长时放行单个探测请求，
    /// 并发竞争者通过对 last 的 CAS 决出唯一胜者。
    pub fn allow(&self) -> bool {
        !self.is_open() || self.allow_single()
    }

    /// 记录一次成功
    ///
    /// Open 状态下的成功意味着探测请求通过，熔断器恢复并清空窗口。
    pub fn success(&self) {
        if self.state.load(Ordering::Acquire) != BreakerState::Open as i32 {
            self.window().last_bucket().success += 1;
        } else {
            self.reset();
        }
    }

    /// 记录一次失败，必要时触发熔断
    pub fn fail(&self) {
        self.window().last_bucket().failure += 1;
    }

    /// 当前状态，仅用于观测
    pub fn state(&self) -> BreakerState {
        if self.state.load(Ordering::Acquire) == BreakerState::Open as i32 {
            BreakerState::Open
        } else {
            BreakerState::Closed
        }
    }

    fn window(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn elapsed_nanos(&self) -> i64 {
        self.created.elapsed().as_nanos() as i64
    }

    fn allow_single(&self) -> bool {
        let now = self.elapsed_nanos();
        let last = self.last.load(Ordering::Acquire);
        if now - last > self.sleep_nanos {
            return self
                .last
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        }
        false
    }

    fn is_open(&self) -> bool {
        if self.state.load(Ordering::Acquire) == BreakerState::Open as i32 {
            return true;
        }
        let (total, ratio) = self.window().stat();
        if total < self.min_requests || ratio < self.ratio {
            return false;
        }
        if self
            .state
            .compare_exchange(
                BreakerState::Closed as i32,
                BreakerState::Open as i32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.last.store(self.elapsed_nanos(), Ordering::Release);
            if let Some(f) = &self.on_state {
                f(BreakerState::Open);
            }
        }
        true
    }

    fn reset(&self) {
        if self
            .state
            .compare_exchange(
                BreakerState::Open as i32,
                BreakerState::Closed as i32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.window().reset();
            if let Some(f) = &self.on_state {
                f(BreakerState::Closed);
            }
        }
    }
}
