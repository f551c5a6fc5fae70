//! 后台回收任务。
//!
//! # 教案式说明
//! - **意图 (Why)**：没有新消息到达时，超时的分组也必须被处置；回收任务以固定周期扫描仓储快照，
//!   与流量完全解耦。
//! - **契约 (What)**：
//!   - 每个周期调用一次 [`Aggregator::reap_expired`]，周期由注入的 [`Clock`](crate::Clock) 计时；
//!   - 投递失败只记录日志，任务继续运行；
//!   - [`ReaperHandle::stop`] 发出停止信号并等待任务退出，之后不会再有新的扫描开始；
//!   - [`ReaperHandle::shutdown`] 先停止任务，再按配置的 [`DrainPolicy`](crate::DrainPolicy) 排空。
//! - **执行 (How)**：`tokio::sync::watch` 传递停止信号，`tokio::select!` 以 `biased` 方式
//!   优先响应停止，其次才是下一个周期。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

use crate::aggregator::{Aggregator, DrainReport};

/// 回收任务的配置与入口。
#[derive(Debug)]
pub struct Reaper {
    aggregator: Arc<Aggregator>,
    interval: Duration,
}

enum Wake {
    Tick,
    Signal,
    Closed,
}

impl Reaper {
    /// 使用聚合器配置中的扫描周期。
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        let interval = aggregator.config().reaper_interval();
        Self {
            aggregator,
            interval,
        }
    }

    /// 覆盖扫描周期，零值按 1 毫秒处理。
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 在当前 Tokio 运行时上启动。必须在运行时上下文内调用。
    pub fn spawn(self) -> ReaperHandle {
        self.spawn_on(&tokio::runtime::Handle::current())
    }

    /// 在指定运行时上启动。
    pub fn spawn_on(self, runtime: &tokio::runtime::Handle) -> ReaperHandle {
        let (shutdown, signal) = watch::channel(false);
        let sweeps = Arc::new(AtomicU64::new(0));
        let aggregator = Arc::clone(&self.aggregator);
        let task = runtime.spawn(self.run(signal, Arc::clone(&sweeps)));
        ReaperHandle {
            shutdown,
            task,
            sweeps,
            aggregator,
        }
    }

    async fn run(self, mut signal: watch::Receiver<bool>, sweeps: Arc<AtomicU64>) {
        info!(
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            "aggregator reaper started"
        );
        loop {
            if *signal.borrow_and_update() {
                break;
            }
            let tick = self.aggregator.clock().sleep(self.interval);
            let wake = tokio::select! {
                biased;
                changed = signal.changed() => match changed {
                    Ok(()) => Wake::Signal,
                    Err(_) => Wake::Closed,
                },
                _ = tick => Wake::Tick,
            };
            match wake {
                Wake::Signal => continue,
                Wake::Closed => break,
                Wake::Tick => {}
            }

            let report = self.aggregator.reap_expired();
            let count = sweeps.fetch_add(1, Ordering::AcqRel) + 1;
            for failure in &report.failures {
                error!(sweep = count, code = failure.code(), error = %failure, "reaper delivery failure");
            }
            debug!(sweep = count, expired = report.expired, "reaper tick");
        }
        info!(sweeps = sweeps.load(Ordering::Acquire), "aggregator reaper stopped");
    }
}

/// 运行中回收任务的句柄。
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    sweeps: Arc<AtomicU64>,
    aggregator: Arc<Aggregator>,
}

impl ReaperHandle {
    /// 已完成的扫描次数。
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 发出停止信号并等待任务退出。
    pub async fn stop(self) -> Result<(), JoinError> {
        // 接收端可能已随任务退出而关闭，此时发送失败无需处理
        let _ = self.shutdown.send(true);
        self.task.await
    }

    /// 停止任务后按配置的排空策略处置剩余分组。
    pub async fn shutdown(self) -> DrainReport {
        let aggregator = Arc::clone(&self.aggregator);
        if let Err(err) = self.stop().await {
            error!(error = %err, "aggregator reaper task ended abnormally");
        }
        aggregator.drain_with_configured_policy()
    }
}

impl fmt::Debug for ReaperHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaperHandle")
            .field("sweeps", &self.sweeps())
            .field("finished", &self.is_finished())
            .finish()
    }
}
