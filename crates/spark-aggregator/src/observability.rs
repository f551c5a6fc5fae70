//! 可观测性：生命周期事件、内建计数器与稳定键名。
//!
//! # 教案式说明
//! - **意图（Why）**：驱逐、超时丢弃与迟到消息都属于“预期内的损失”，不会以错误返回，
//!   因此必须通过事件与计数器显式暴露，否则运维无从察觉。
//! - **契约（What）**：
//!   - 聚合器总是把事件喂给内建的 [`AggregatorMetrics`]，再转发给可选的 [`AggregatorObserver`]；
//!   - 事件在不持有任何内部锁的情况下发出，观察者可以安全地读取聚合器状态；
//!   - 指标名集中在 [`keys`] 中，跨版本保持稳定。
//! - **风险（Trade-offs）**：观察者同步执行，耗时的观察者会拖慢触发事件的生产者线程。

use std::sync::atomic::{AtomicU64, Ordering};

use crate::correlation::CorrelationKey;
use crate::group::{DiscardReason, ReleaseTrigger};

/// 稳定的指标键名。
pub mod keys {
    /// 计数器名称。
    pub mod metrics {
        pub const GROUPS_CREATED: &str = "spark.aggregator.groups.created";
        pub const GROUPS_RELEASED_COMPLETE: &str = "spark.aggregator.groups.released.complete";
        pub const GROUPS_RELEASED_PARTIAL: &str = "spark.aggregator.groups.released.partial";
        pub const GROUPS_DISCARDED_TIMEOUT: &str = "spark.aggregator.groups.discarded.timeout";
        pub const GROUPS_DISCARDED_EVICTED: &str = "spark.aggregator.groups.discarded.evicted";
        pub const GROUPS_DISCARDED_SHUTDOWN: &str = "spark.aggregator.groups.discarded.shutdown";
        pub const GROUPS_DISCARDED_ABANDONED: &str = "spark.aggregator.groups.discarded.abandoned";
        pub const MESSAGES_REJECTED: &str = "spark.aggregator.messages.rejected";
        pub const MESSAGES_LATE: &str = "spark.aggregator.messages.late";
        pub const MESSAGES_DUPLICATE: &str = "spark.aggregator.messages.duplicate";
        pub const MESSAGES_DROPPED: &str = "spark.aggregator.messages.dropped";
        pub const DELIVERY_FAILURES: &str = "spark.aggregator.delivery.failures";
    }
}

/// 单条消息被丢弃的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageDiscardCause {
    /// 准入选择器链拒绝。
    Rejected,
    /// 关联键已完成。
    LateArrival,
    /// 分组内已有相同 `sequenceNumber`。
    Duplicate,
}

impl MessageDiscardCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rejected => "rejected",
            Self::LateArrival => "late_arrival",
            Self::Duplicate => "duplicate",
        }
    }
}

/// 聚合器生命周期事件。
///
/// `routed` 表示消息是否已送入丢弃通道；为 `false` 时消息仅被记录后丢弃。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregatorEvent<'a> {
    GroupCreated {
        key: &'a CorrelationKey,
    },
    GroupReleased {
        key: &'a CorrelationKey,
        members: usize,
        outputs: usize,
        trigger: ReleaseTrigger,
    },
    GroupDiscarded {
        key: &'a CorrelationKey,
        members: usize,
        reason: DiscardReason,
        routed: bool,
    },
    MessageDiscarded {
        key: Option<&'a CorrelationKey>,
        cause: MessageDiscardCause,
        routed: bool,
    },
    DeliveryFailed {
        key: &'a CorrelationKey,
        code: &'static str,
    },
}

/// 事件观察者。
pub trait AggregatorObserver: Send + Sync + 'static {
    fn on_event(&self, event: &AggregatorEvent<'_>);
}

impl<F> AggregatorObserver for F
where
    F: Fn(&AggregatorEvent<'_>) + Send + Sync + 'static,
{
    fn on_event(&self, event: &AggregatorEvent<'_>) {
        self(event)
    }
}

/// 内建原子计数器。
#[derive(Debug, Default)]
pub struct AggregatorMetrics {
    groups_created: AtomicU64,
    groups_released_complete: AtomicU64,
    groups_released_partial: AtomicU64,
    groups_discarded_timeout: AtomicU64,
    groups_discarded_evicted: AtomicU64,
    groups_discarded_shutdown: AtomicU64,
    groups_discarded_abandoned: AtomicU64,
    messages_rejected: AtomicU64,
    messages_late: AtomicU64,
    messages_duplicate: AtomicU64,
    messages_dropped: AtomicU64,
    delivery_failures: AtomicU64,
}

impl AggregatorMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            groups_created: read(&self.groups_created),
            groups_released_complete: read(&self.groups_released_complete),
            groups_released_partial: read(&self.groups_released_partial),
            groups_discarded_timeout: read(&self.groups_discarded_timeout),
            groups_discarded_evicted: read(&self.groups_discarded_evicted),
            groups_discarded_shutdown: read(&self.groups_discarded_shutdown),
            groups_discarded_abandoned: read(&self.groups_discarded_abandoned),
            messages_rejected: read(&self.messages_rejected),
            messages_late: read(&self.messages_late),
            messages_duplicate: read(&self.messages_duplicate),
            messages_dropped: read(&self.messages_dropped),
            delivery_failures: read(&self.delivery_failures),
        }
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl AggregatorObserver for AggregatorMetrics {
    fn on_event(&self, event: &AggregatorEvent<'_>) {
        match *event {
            AggregatorEvent::GroupCreated { .. } => bump(&self.groups_created, 1),
            AggregatorEvent::GroupReleased { trigger, .. } => {
                if trigger.is_partial() {
                    bump(&self.groups_released_partial, 1);
                } else {
                    bump(&self.groups_released_complete, 1);
                }
            }
            AggregatorEvent::GroupDiscarded {
                reason,
                members,
                routed,
                ..
            } => {
                let counter = match reason {
                    DiscardReason::Timeout => &self.groups_discarded_timeout,
                    DiscardReason::Evicted => &self.groups_discarded_evicted,
                    DiscardReason::Shutdown => &self.groups_discarded_shutdown,
                    DiscardReason::Abandoned => &self.groups_discarded_abandoned,
                };
                bump(counter, 1);
                if !routed {
                    bump(&self.messages_dropped, members as u64);
                }
            }
            AggregatorEvent::MessageDiscarded { cause, routed, .. } => {
                let counter = match cause {
                    MessageDiscardCause::Rejected => &self.messages_rejected,
                    MessageDiscardCause::LateArrival => &self.messages_late,
                    MessageDiscardCause::Duplicate => &self.messages_duplicate,
                };
                bump(counter, 1);
                if !routed {
                    bump(&self.messages_dropped, 1);
                }
            }
            AggregatorEvent::DeliveryFailed { .. } => bump(&self.delivery_failures, 1),
        }
    }
}

/// 计数器的某一时刻读数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub groups_created: u64,
    pub groups_released_complete: u64,
    pub groups_released_partial: u64,
    pub groups_discarded_timeout: u64,
    pub groups_discarded_evicted: u64,
    pub groups_discarded_shutdown: u64,
    pub groups_discarded_abandoned: u64,
    pub messages_rejected: u64,
    pub messages_late: u64,
    pub messages_duplicate: u64,
    pub messages_dropped: u64,
    pub delivery_failures: u64,
}

impl MetricsSnapshot {
    pub fn groups_released(&self) -> u64 {
        self.groups_released_complete + self.groups_released_partial
    }

    pub fn groups_discarded(&self) -> u64 {
        self.groups_discarded_timeout
            + self.groups_discarded_evicted
            + self.groups_discarded_shutdown
            + self.groups_discarded_abandoned
    }

    /// 以稳定键名列出全部计数器，便于导出到外部指标系统。
    pub fn entries(&self) -> [(&'static str, u64); 12] {
        use keys::metrics::*;
        [
            (GROUPS_CREATED, self.groups_created),
            (GROUPS_RELEASED_COMPLETE, self.groups_released_complete),
            (GROUPS_RELEASED_PARTIAL, self.groups_released_partial),
            (GROUPS_DISCARDED_TIMEOUT, self.groups_discarded_timeout),
            (GROUPS_DISCARDED_EVICTED, self.groups_discarded_evicted),
            (GROUPS_DISCARDED_SHUTDOWN, self.groups_discarded_shutdown),
            (GROUPS_DISCARDED_ABANDONED, self.groups_discarded_abandoned),
            (MESSAGES_REJECTED, self.messages_rejected),
            (MESSAGES_LATE, self.messages_late),
            (MESSAGES_DUPLICATE, self.messages_duplicate),
            (MESSAGES_DROPPED, self.messages_dropped),
            (DELIVERY_FAILURES, self.delivery_failures),
        ]
    }
}
