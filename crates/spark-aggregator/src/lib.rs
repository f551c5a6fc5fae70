//! # spark-aggregator
//!
//! ## 定位与职责（Why）
//! - 实现“聚合器”集成模式：共享同一关联键的消息在引擎内缓冲，满足完整性条件或超时后
//!   合并为一条出站消息，并保证每个关联键至多释放一次；
//! - 提供可插拔的 [`SelectorChain`]，既用于单条消息的准入判定，也可作为分组层面的完整性谓词。
//!
//! ## 架构嵌入（Where）
//! - `selector`、`reply`、`message`、`channel` 为叶子模块，不依赖引擎内部状态；
//! - `group` 模块承载 [`CorrelationGroup`] 状态机与有界的 [`GroupStore`]；
//! - `aggregator` 负责编排：准入 → 取得/创建分组 → 追加 → 完整性判定 → 释放；
//! - `reaper` 以固定周期扫描存储快照，与完整性路径竞争同一分组的释放权；
//! - `config`、`observability`、`time`、`error` 为横切能力。
//!
//! ## 并发模型（What）
//! - 多个生产者线程并发调用 [`Aggregator::handle`]，后台仅有一个 [`Reaper`] 任务；
//! - 分组的追加与释放抢占只在分组自身的互斥锁内进行，存储的全局临界区只覆盖“新键准入”；
//! - 任何通道发送都发生在分组离开 `Open` 状态之后，不持有任何锁。

pub mod aggregator;
pub mod channel;
pub mod completion;
pub mod config;
pub mod correlation;
pub mod error;
pub mod group;
pub mod message;
pub mod observability;
pub mod reaper;
pub mod reply;
pub mod selector;
#[cfg(feature = "subscriber")]
pub mod telemetry;
pub mod time;

pub use aggregator::{Aggregator, AggregatorBuilder, DrainReport, HandleOutcome, SweepReport};
pub use channel::{ChannelRegistry, ChannelResolver, MessageChannel, QueueChannel};
pub use completion::{CompletionPolicy, SequenceSizeCompletion};
pub use config::{AggregatorConfig, DrainPolicy};
pub use correlation::{CorrelationKey, CorrelationStrategy, HeaderCorrelation};
pub use error::{AggregatorError, ChannelError, ConfigError, SelectorError};
pub use group::{Admission, CorrelationGroup, DiscardReason, GroupId, GroupState, GroupStore, ReleaseTrigger};
pub use message::{
    HeaderValue, Message, MessageBuilder, MessageHeaders, MessageId, Payload, ReplyTarget, headers,
};
pub use observability::{
    AggregatorEvent, AggregatorMetrics, AggregatorObserver, MessageDiscardCause, MetricsSnapshot,
};
pub use reaper::{Reaper, ReaperHandle};
pub use reply::{GroupProcessor, MemberOrder, PayloadListProcessor, Reply, ReplyBuilder};
pub use selector::{HeaderSelector, MessageSelector, SelectorChain, SelectorVote, VotingStrategy};
pub use time::{Clock, MockClock, SystemClock};
