//! # Aggregator：聚合编排
//!
//! ## 核心意图（Why）
//! - 串起一条消息的完整旅程：准入 → 提取关联键 → 取得分组 → 追加并判定 → 释放；
//! - 同时为回收任务与停机排空提供同一套“抢占后处置”逻辑，保证三条路径的语义一致。
//!
//! ## 行为契约（What）
//! - 同一关联键无论有多少并发完成者与回收任务，最多释放一次；
//! - 处理器、通道发送与观察者回调都在不持有任何锁的情况下执行；
//! - 完整性路径上的投递失败返回给 [`Aggregator::handle`] 的调用方，分组不会重新打开；
//! - 驱逐、超时丢弃、迟到与重复消息不是错误，通过日志、计数器与事件暴露。
//!
//! ## 输出通道解析顺序（How）
//! 1. 处理器在 [`ReplyBuilder`] 上设置的目标；
//! 2. 构建时配置的输出通道；
//! 3. 首个成员的 `replyChannel` 头部（名称经 [`ChannelResolver`] 解析）；
//! 4. 丢弃通道；
//! 5. 以上皆无时返回 [`AggregatorError::NoReplyChannel`]。

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::channel::{ChannelResolver, MessageChannel};
use crate::completion::{CompletionPolicy, SequenceSizeCompletion};
use crate::config::{AggregatorConfig, DrainPolicy};
use crate::correlation::{CorrelationKey, CorrelationStrategy, HeaderCorrelation};
use crate::error::AggregatorError;
use crate::group::{
    Admission, AppendOutcome, Claim, ClaimedGroup, CorrelationGroup, DiscardReason, GroupStore,
    ReleaseTrigger,
};
use crate::message::{Message, MessageBuilder, ReplyTarget};
use crate::observability::{
    AggregatorEvent, AggregatorMetrics, AggregatorObserver, MessageDiscardCause, MetricsSnapshot,
};
use crate::reply::{GroupProcessor, PayloadListProcessor, Reply, ReplyBuilder};
use crate::selector::SelectorChain;
use crate::time::{Clock, SystemClock};

/// [`Aggregator::handle`] 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleOutcome {
    /// 消息已缓冲，分组尚未完整。
    Buffered { group_size: usize },
    /// 本条消息使分组完整，`outputs` 条出站消息已发送。
    Released { outputs: usize },
    /// 准入选择器链拒绝。
    Rejected,
    /// 关联键已完成或其分组正在关闭。
    LateArrival,
    /// 分组内已有相同 `sequenceNumber`。
    Duplicate,
}

/// 一次回收扫描的结果。
#[derive(Debug, Default)]
pub struct SweepReport {
    /// 快照中已超时的分组数。
    pub expired: usize,
    pub released: usize,
    pub discarded: usize,
    /// 超时但已被其他路径抢占的分组数。
    pub lost_races: usize,
    pub failures: Vec<AggregatorError>,
}

/// 停机排空的结果。
#[derive(Debug, Default)]
pub struct DrainReport {
    pub policy: DrainPolicy,
    pub released: usize,
    pub discarded: usize,
    /// `Leave` 策略下保留的分组数。
    pub left_open: usize,
    pub failures: Vec<AggregatorError>,
}

enum Settled {
    Released { outputs: usize },
    Discarded,
}

/// 聚合器构建器。
///
/// # 教案式说明
/// - **意图 (Why)**：通道、谓词与处理器不可序列化，只能以对象形式注入；
///   构建器把它们与 [`AggregatorConfig`] 组合起来并一次性校验。
/// - **契约 (What)**：未设置的协作者使用默认实现：按配置头部关联、按 `sequenceSize` 判定完整、
///   载荷列表处理器、系统时钟。
pub struct AggregatorBuilder {
    config: AggregatorConfig,
    correlation: Option<Arc<dyn CorrelationStrategy>>,
    completion: Option<Arc<dyn CompletionPolicy>>,
    processor: Option<Arc<dyn GroupProcessor>>,
    admission: Option<SelectorChain<Message>>,
    output_channel: Option<Arc<dyn MessageChannel>>,
    discard_channel: Option<Arc<dyn MessageChannel>>,
    resolver: Option<Arc<dyn ChannelResolver>>,
    observer: Option<Arc<dyn AggregatorObserver>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AggregatorBuilder {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            correlation: None,
            completion: None,
            processor: None,
            admission: None,
            output_channel: None,
            discard_channel: None,
            resolver: None,
            observer: None,
            clock: None,
        }
    }

    pub fn correlation_strategy(mut self, strategy: impl CorrelationStrategy) -> Self {
        self.correlation = Some(Arc::new(strategy));
        self
    }

    pub fn completion_policy(mut self, policy: impl CompletionPolicy) -> Self {
        self.completion = Some(Arc::new(policy));
        self
    }

    pub fn processor(mut self, processor: impl GroupProcessor) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    /// 单条消息的准入选择器链；被拒绝的消息转入丢弃通道。
    pub fn admission(mut self, chain: SelectorChain<Message>) -> Self {
        self.admission = Some(chain);
        self
    }

    pub fn output_channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.output_channel = Some(channel);
        self
    }

    pub fn discard_channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.discard_channel = Some(channel);
        self
    }

    pub fn channel_resolver(mut self, resolver: Arc<dyn ChannelResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn observer(mut self, observer: impl AggregatorObserver) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// 校验配置并构建聚合器。
    pub fn build(self) -> Result<Aggregator, AggregatorError> {
        self.config.validate()?;
        let config = self.config;
        let correlation: Arc<dyn CorrelationStrategy> = match self.correlation {
            Some(strategy) => strategy,
            None => Arc::new(HeaderCorrelation::new(config.correlation_header.clone())),
        };
        let completion: Arc<dyn CompletionPolicy> = match self.completion {
            Some(policy) => policy,
            None => Arc::new(SequenceSizeCompletion),
        };
        let processor: Arc<dyn GroupProcessor> = match self.processor {
            Some(processor) => processor,
            None => Arc::new(PayloadListProcessor::new(
                config.member_order,
                config.correlation_header.clone(),
            )),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        Ok(Aggregator {
            store: GroupStore::new(
                config.tracked_correlation_id_capacity,
                config.completed_key_capacity,
            ),
            correlation,
            completion,
            processor,
            admission: self.admission,
            output_channel: self.output_channel,
            discard_channel: self.discard_channel,
            resolver: self.resolver,
            observer: self.observer,
            metrics: AggregatorMetrics::default(),
            clock,
            config,
        })
    }
}

impl fmt::Debug for AggregatorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatorBuilder")
            .field("config", &self.config)
            .field("admission", &self.admission)
            .finish_non_exhaustive()
    }
}

/// 基于关联键的消息聚合器。
///
/// # 教案式说明
/// - **意图 (Why)**：把分散到达的相关消息合并为一条，同时在超时、容量压力与停机时
///   给出确定的处置结果。
/// - **契约 (What)**：
///   - `Aggregator` 是 `Send + Sync`，以 `Arc` 共享给生产者线程与 [`crate::Reaper`]；
///   - [`handle`](Self::handle) 同步完成，释放路径会在调用线程上执行处理器与通道发送；
///   - [`reap_expired`](Self::reap_expired) 与 [`drain`](Self::drain) 可以直接调用，
///     便于测试与宿主自行调度。
/// - **风险 (Trade-offs)**：投递失败不会重试，宿主若需要可靠投递应在通道实现内部处理。
pub struct Aggregator {
    config: AggregatorConfig,
    store: GroupStore,
    correlation: Arc<dyn CorrelationStrategy>,
    completion: Arc<dyn CompletionPolicy>,
    processor: Arc<dyn GroupProcessor>,
    admission: Option<SelectorChain<Message>>,
    output_channel: Option<Arc<dyn MessageChannel>>,
    discard_channel: Option<Arc<dyn MessageChannel>>,
    resolver: Option<Arc<dyn ChannelResolver>>,
    observer: Option<Arc<dyn AggregatorObserver>>,
    metrics: AggregatorMetrics,
    clock: Arc<dyn Clock>,
}

impl Aggregator {
    /// 以默认配置开始构建。
    pub fn builder() -> AggregatorBuilder {
        AggregatorBuilder::new(AggregatorConfig::default())
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn store(&self) -> &GroupStore {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// 准入选择器链的共享句柄，可用于运行时调整规则。
    pub fn admission(&self) -> Option<&SelectorChain<Message>> {
        self.admission.as_ref()
    }

    /// 处理一条入站消息。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 缺少关联键返回 [`AggregatorError::MissingCorrelationKey`]；
    ///   - 完整性判定失败时消息不会留在分组中；
    ///   - 本条消息触发释放时，投递结果直接反映在返回值中。
    /// - **执行 (How)**：追加到已被驱逐或在空置时被关闭的分组时，先确认旧分组已离开仓储再重试，
    ///   因此消息会进入一个新分组而不是随旧分组一起被丢弃。
    pub fn handle(&self, message: Message) -> Result<HandleOutcome, AggregatorError> {
        if let Some(admission) = &self.admission {
            if !admission.accept(&message) {
                self.discard_message(None, message, MessageDiscardCause::Rejected);
                return Ok(HandleOutcome::Rejected);
            }
        }

        let Some(key) = self.correlation.correlation_key(&message) else {
            return Err(AggregatorError::MissingCorrelationKey {
                header: self.correlation.describe().into_owned(),
                message_id: message.id(),
            });
        };

        let mut pending = message;
        loop {
            let group = match self.store.get_or_create(&key, self.clock.now()) {
                Admission::Existing(group) => group,
                Admission::Created { group, evicted } => {
                    debug!(correlation_key = %key, group = %group.id(), "correlation group created");
                    self.emit(AggregatorEvent::GroupCreated { key: &key });
                    for claimed in evicted {
                        self.settle_quietly(claimed);
                    }
                    group
                }
                Admission::Completed => {
                    self.discard_message(Some(&key), pending, MessageDiscardCause::LateArrival);
                    return Ok(HandleOutcome::LateArrival);
                }
            };

            let outcome = group.append(
                pending,
                self.config.reject_duplicate_sequence_numbers,
                |members| self.completion.is_complete(&key, members),
            )?;
            match outcome {
                AppendOutcome::Buffered { size } => {
                    trace!(correlation_key = %key, group_size = size, "message buffered");
                    return Ok(HandleOutcome::Buffered { group_size: size });
                }
                AppendOutcome::Complete(claimed) => {
                    return match self.settle(claimed)? {
                        Settled::Released { outputs } => Ok(HandleOutcome::Released { outputs }),
                        Settled::Discarded => Ok(HandleOutcome::Released { outputs: 0 }),
                    };
                }
                AppendOutcome::Duplicate(message) => {
                    self.discard_message(Some(&key), message, MessageDiscardCause::Duplicate);
                    return Ok(HandleOutcome::Duplicate);
                }
                AppendOutcome::Closed {
                    discard_reason: Some(reason),
                    message,
                    ..
                } if !reason.tracks_completion() => {
                    self.store.retire(&group, false);
                    pending = message;
                }
                AppendOutcome::Closed { message, .. } => {
                    self.discard_message(Some(&key), message, MessageDiscardCause::LateArrival);
                    return Ok(HandleOutcome::LateArrival);
                }
            }
        }
    }

    /// 扫描一次仓储，处置所有超时分组。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 超时以分组创建时刻为基准，使用注入的时钟；
    ///   - 抢占时若分组恰好已满足完整性条件，按完整释放；
    ///   - 否则按 `send_partial_result_on_timeout` 部分释放或丢弃；
    ///   - 投递失败记录在报告中并继续处理其他分组。
    pub fn reap_expired(&self) -> SweepReport {
        let now = self.clock.now();
        let timeout = self.config.group_timeout();
        let partial = self.config.send_partial_result_on_timeout;
        let mut report = SweepReport::default();

        for group in self.store.snapshot() {
            if !group.is_expired(now, timeout) {
                continue;
            }
            report.expired += 1;
            let key = group.key().clone();
            let claimed = group.try_claim_with(|members| {
                if members.is_empty() {
                    return Some(Claim::Discard(DiscardReason::Abandoned));
                }
                match self.completion.is_complete(&key, members) {
                    Ok(true) => Some(Claim::Release(ReleaseTrigger::Complete)),
                    _ if partial => Some(Claim::Release(ReleaseTrigger::Timeout)),
                    _ => Some(Claim::Discard(DiscardReason::Timeout)),
                }
            });
            let Some(claimed) = claimed else {
                report.lost_races += 1;
                continue;
            };
            match self.settle(claimed) {
                Ok(Settled::Released { .. }) => report.released += 1,
                Ok(Settled::Discarded) => report.discarded += 1,
                Err(err) => {
                    error!(
                        correlation_key = %key,
                        code = err.code(),
                        error = %err,
                        "failed to deliver expired group"
                    );
                    report.failures.push(err);
                }
            }
        }

        if report.expired > 0 {
            debug!(
                expired = report.expired,
                released = report.released,
                discarded = report.discarded,
                lost_races = report.lost_races,
                "reaper sweep finished"
            );
        }
        report
    }

    /// 按策略处置全部剩余分组。应在回收任务停止之后调用。
    pub fn drain(&self, policy: DrainPolicy) -> DrainReport {
        let mut report = DrainReport {
            policy,
            ..DrainReport::default()
        };
        let claim = match policy {
            DrainPolicy::Leave => {
                report.left_open = self
                    .store
                    .snapshot()
                    .iter()
                    .filter(|group| group.state().is_open())
                    .count();
                info!(left_open = report.left_open, "aggregator drained, open groups left in place");
                return report;
            }
            DrainPolicy::ReleasePartial => Claim::Release(ReleaseTrigger::Shutdown),
            DrainPolicy::Discard => Claim::Discard(DiscardReason::Shutdown),
        };

        for group in self.store.snapshot() {
            let claimed = group.try_claim_with(|members| {
                if members.is_empty() {
                    Some(Claim::Discard(DiscardReason::Abandoned))
                } else {
                    Some(claim)
                }
            });
            let Some(claimed) = claimed else {
                continue;
            };
            match self.settle(claimed) {
                Ok(Settled::Released { .. }) => report.released += 1,
                Ok(Settled::Discarded) => report.discarded += 1,
                Err(err) => {
                    warn!(correlation_key = %group.key(), error = %err, "drain delivery failed");
                    report.failures.push(err);
                }
            }
        }

        info!(
            released = report.released,
            discarded = report.discarded,
            failures = report.failures.len(),
            "aggregator drained"
        );
        report
    }

    /// 按配置中的 [`DrainPolicy`] 排空。
    pub fn drain_with_configured_policy(&self) -> DrainReport {
        self.drain(self.config.drain_policy)
    }

    fn settle(&self, claimed: ClaimedGroup) -> Result<Settled, AggregatorError> {
        let (group, claim, members) = claimed.into_parts();
        match claim {
            Claim::Release(trigger) => self
                .release(&group, trigger, members)
                .map(|outputs| Settled::Released { outputs }),
            Claim::Discard(reason) => {
                self.discard_group(&group, reason, members);
                Ok(Settled::Discarded)
            }
        }
    }

    fn settle_quietly(&self, claimed: ClaimedGroup) {
        if let Err(err) = self.settle(claimed) {
            warn!(code = err.code(), error = %err, "failed to settle claimed group");
        }
    }

    fn release(
        &self,
        group: &CorrelationGroup,
        trigger: ReleaseTrigger,
        members: Vec<Message>,
    ) -> Result<usize, AggregatorError> {
        let key = group.key();
        let mut reply = ReplyBuilder::new();
        self.processor.process(key, &members, &mut reply);
        let request_reply = members
            .first()
            .and_then(|member| member.headers().reply_channel().cloned());

        let result = self.deliver(key, reply.build(), request_reply.as_ref());
        group.finish();
        self.store.retire(group, true);

        match &result {
            Ok(outputs) => {
                if trigger.is_partial() {
                    info!(
                        correlation_key = %key,
                        group_size = members.len(),
                        reason = trigger.as_str(),
                        "correlation group released with partial result"
                    );
                } else {
                    debug!(correlation_key = %key, group_size = members.len(), "correlation group released");
                }
                self.emit(AggregatorEvent::GroupReleased {
                    key,
                    members: members.len(),
                    outputs: *outputs,
                    trigger,
                });
            }
            Err(err) => {
                warn!(
                    correlation_key = %key,
                    group_size = members.len(),
                    code = err.code(),
                    error = %err,
                    "correlation group release failed"
                );
                self.emit(AggregatorEvent::DeliveryFailed {
                    key,
                    code: err.code(),
                });
            }
        }
        result
    }

    fn deliver(
        &self,
        key: &CorrelationKey,
        reply: Reply,
        request_reply: Option<&ReplyTarget>,
    ) -> Result<usize, AggregatorError> {
        let (messages, target) = reply.into_parts();
        if messages.is_empty() {
            return Ok(0);
        }
        let channel = self.resolve_output(key, target.as_ref(), request_reply)?;
        let outputs = messages.len();
        for message in messages {
            let message = match request_reply {
                Some(origin) if !origin.refers_to(&channel) => MessageBuilder::from_message(&message)
                    .reply_channel_if_absent(origin.clone())
                    .build(),
                _ => message,
            };
            self.send(&channel, key, message)?;
        }
        Ok(outputs)
    }

    fn resolve_output(
        &self,
        key: &CorrelationKey,
        target: Option<&ReplyTarget>,
        request_reply: Option<&ReplyTarget>,
    ) -> Result<Arc<dyn MessageChannel>, AggregatorError> {
        if let Some(target) = target {
            return self.resolve_target(target);
        }
        if let Some(channel) = &self.output_channel {
            return Ok(Arc::clone(channel));
        }
        let unresolved = match request_reply.map(|origin| self.resolve_target(origin)) {
            Some(Ok(channel)) => return Ok(channel),
            Some(Err(err)) => Some(err),
            None => None,
        };
        if let Some(channel) = &self.discard_channel {
            if let Some(err) = &unresolved {
                warn!(
                    correlation_key = %key,
                    error = %err,
                    "reply channel unresolved, routing aggregate to discard channel"
                );
            }
            return Ok(Arc::clone(channel));
        }
        Err(unresolved.unwrap_or_else(|| AggregatorError::NoReplyChannel { key: key.clone() }))
    }

    fn resolve_target(&self, target: &ReplyTarget) -> Result<Arc<dyn MessageChannel>, AggregatorError> {
        match target {
            ReplyTarget::Channel(channel) => Ok(Arc::clone(channel)),
            ReplyTarget::Name(name) => self
                .resolver
                .as_ref()
                .and_then(|resolver| resolver.resolve(name))
                .ok_or_else(|| AggregatorError::ChannelResolution {
                    name: name.to_string(),
                }),
        }
    }

    fn send(
        &self,
        channel: &Arc<dyn MessageChannel>,
        key: &CorrelationKey,
        message: Message,
    ) -> Result<(), AggregatorError> {
        match channel.send(message) {
            Ok(true) => Ok(()),
            Ok(false) => Err(AggregatorError::DeliveryRejected {
                key: key.clone(),
                channel: channel.name().to_owned(),
            }),
            Err(source) => Err(AggregatorError::Delivery {
                key: key.clone(),
                channel: channel.name().to_owned(),
                source,
            }),
        }
    }

    fn discard_group(&self, group: &CorrelationGroup, reason: DiscardReason, members: Vec<Message>) {
        let key = group.key();
        let size = members.len();
        let routed = match &self.discard_channel {
            Some(channel) => members.into_iter().fold(true, |routed, member| {
                match self.send(channel, key, member) {
                    Ok(()) => routed,
                    Err(err) => {
                        warn!(correlation_key = %key, error = %err, "discard channel did not accept group member");
                        false
                    }
                }
            }),
            None => size == 0,
        };
        group.finish();
        self.store.retire(group, reason.tracks_completion());

        match reason {
            DiscardReason::Evicted => warn!(
                correlation_key = %key,
                group_size = size,
                reason = reason.as_str(),
                routed,
                "correlation group evicted to admit a new key"
            ),
            DiscardReason::Abandoned => debug!(
                correlation_key = %key,
                reason = reason.as_str(),
                "empty correlation group closed"
            ),
            DiscardReason::Timeout | DiscardReason::Shutdown => info!(
                correlation_key = %key,
                group_size = size,
                reason = reason.as_str(),
                routed,
                "correlation group discarded"
            ),
        }
        if !routed {
            warn!(correlation_key = %key, group_size = size, "discarded group members dropped, no discard channel");
        }
        self.emit(AggregatorEvent::GroupDiscarded {
            key,
            members: size,
            reason,
            routed,
        });
    }

    fn discard_message(&self, key: Option<&CorrelationKey>, message: Message, cause: MessageDiscardCause) {
        let message_id = message.id();
        let routed = match &self.discard_channel {
            Some(channel) => match channel.send(message) {
                Ok(true) => true,
                Ok(false) => false,
                Err(err) => {
                    warn!(message_id = %message_id, error = %err, "discard channel failed");
                    false
                }
            },
            None => false,
        };
        let correlation_key = key.map(CorrelationKey::as_str);
        match cause {
            MessageDiscardCause::LateArrival => warn!(
                correlation_key,
                message_id = %message_id,
                reason = cause.as_str(),
                routed,
                "late message for completed correlation key"
            ),
            _ if !routed => warn!(
                correlation_key,
                message_id = %message_id,
                reason = cause.as_str(),
                "message dropped, no discard channel accepted it"
            ),
            _ => debug!(
                correlation_key,
                message_id = %message_id,
                reason = cause.as_str(),
                "message routed to discard channel"
            ),
        }
        self.emit(AggregatorEvent::MessageDiscarded { key, cause, routed });
    }

    fn emit(&self, event: AggregatorEvent<'_>) {
        self.metrics.on_event(&event);
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
    }
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("config", &self.config)
            .field("open_groups", &self.store.len())
            .field("output_channel", &self.output_channel.as_ref().map(|c| c.name().to_owned()))
            .field("discard_channel", &self.discard_channel.as_ref().map(|c| c.name().to_owned()))
            .finish_non_exhaustive()
    }
}
