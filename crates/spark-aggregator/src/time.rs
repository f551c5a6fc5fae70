//! 可注入的时钟。
//!
//! # 教案式说明
//! - **意图 (Why)**：分组超时与回收周期都依赖时间；直接读取系统时钟会让超时测试变得不可复现。
//! - **契约 (What)**：
//!   - [`Clock::now`] 单调不减；
//!   - [`Clock::sleep`] 返回的 Future 至少等待给定时长才完成；
//!   - [`SystemClock`] 委托给 Tokio，使 `start_paused` 的测试同样可以控制它；
//!   - [`MockClock`] 只有在 [`MockClock::advance`] 时才前进。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 时钟返回的统一睡眠 Future。
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration) -> Sleep;
}

/// 委托 Tokio 时间驱动的系统时钟。
///
/// `now` 读取 `tokio::time::Instant`，在暂停的测试运行时中随 `tokio::time::advance` 前进。
/// `sleep` 需要在 Tokio 运行时内被轮询。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// 手动推进的虚拟时钟。
///
/// # 教案式说明
/// - **意图 (Why)**：让超时与回收逻辑在测试中按确定的顺序发生，无需真实等待。
/// - **契约 (What)**：
///   - 克隆共享同一时间线；
///   - `advance` 返回前唤醒所有到期的睡眠，唤醒顺序与登记顺序一致；
///   - 睡眠 Future 被提前丢弃时从等待列表中移除。
/// - **执行 (How)**：`parking_lot::Mutex` 保护偏移量与等待列表；唤醒在释放锁之后进行，
///   避免被唤醒的任务在同一线程上重入时死锁。
#[derive(Clone, Debug)]
pub struct MockClock {
    shared: Arc<Mutex<Timeline>>,
}

#[derive(Debug)]
struct Timeline {
    origin: Instant,
    elapsed: Duration,
    sleepers: Vec<Arc<Sleeper>>,
    next_id: u64,
}

#[derive(Debug)]
struct Sleeper {
    id: u64,
    deadline: Duration,
    fired: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    pub fn with_start(origin: Instant) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Timeline {
                origin,
                elapsed: Duration::ZERO,
                sleepers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// 推进虚拟时间并唤醒到期的睡眠。
    pub fn advance(&self, delta: Duration) {
        let mut due = Vec::new();
        {
            let mut timeline = self.shared.lock();
            timeline.elapsed = timeline.elapsed.saturating_add(delta);
            let elapsed = timeline.elapsed;
            timeline.sleepers.retain(|sleeper| {
                if elapsed >= sleeper.deadline {
                    sleeper.fired.store(true, Ordering::Release);
                    due.push(Arc::clone(sleeper));
                    false
                } else {
                    true
                }
            });
        }
        for sleeper in due {
            if let Some(waker) = sleeper.waker.lock().take() {
                waker.wake();
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.shared.lock().elapsed
    }

    /// 尚未到期的睡眠数量。
    pub fn pending_sleepers(&self) -> usize {
        self.shared.lock().sleepers.len()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let timeline = self.shared.lock();
        timeline.origin + timeline.elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let mut timeline = self.shared.lock();
        let sleeper = Arc::new(Sleeper {
            id: timeline.next_id,
            deadline: timeline.elapsed.saturating_add(duration),
            fired: AtomicBool::new(duration.is_zero()),
            waker: Mutex::new(None),
        });
        timeline.next_id += 1;
        if !duration.is_zero() {
            timeline.sleepers.push(Arc::clone(&sleeper));
        }
        Box::pin(MockSleep {
            shared: Arc::clone(&self.shared),
            sleeper,
        })
    }
}

struct MockSleep {
    shared: Arc<Mutex<Timeline>>,
    sleeper: Arc<Sleeper>,
}

impl Future for MockSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.sleeper.fired.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        *self.sleeper.waker.lock() = Some(cx.waker().clone());
        // advance 可能在登记 waker 之前已触发
        if self.sleeper.fired.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

impl Drop for MockSleep {
    fn drop(&mut self) {
        if !self.sleeper.fired.load(Ordering::Acquire) {
            let id = self.sleeper.id;
            self.shared.lock().sleepers.retain(|sleeper| sleeper.id != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn advance_moves_now_and_wakes_due_sleepers() {
        let clock = MockClock::new();
        let start = clock.now();
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let mut cx = Context::from_waker(&waker);

        let mut sleep = clock.sleep(Duration::from_millis(100));
        assert!(sleep.as_mut().poll(&mut cx).is_pending());

        clock.advance(Duration::from_millis(60));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0, "未到期不得唤醒");

        clock.advance(Duration::from_millis(40));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1, "到期应唤醒一次");
        assert!(sleep.as_mut().poll(&mut cx).is_ready());
        assert_eq!(clock.now() - start, Duration::from_millis(100));
    }

    #[test]
    fn dropped_sleep_is_unregistered() {
        let clock = MockClock::new();
        let sleep = clock.sleep(Duration::from_secs(1));
        assert_eq!(clock.pending_sleepers(), 1);
        drop(sleep);
        assert_eq!(clock.pending_sleepers(), 0, "丢弃的睡眠应从等待列表移除");
    }
}
