//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义聚合引擎对外暴露的错误语义：配置错误、选择器编辑错误、通道投递错误；
//! - 为每个变体提供稳定的点分错误码，供日志、指标与告警系统做低基数聚合。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 [`thiserror::Error`]，`Display` 文案使用英文，便于跨团队检索；
//! - “配置类”错误需要快速失败，调用方可以通过 [`AggregatorError::is_configuration`] 区分；
//! - 投递失败对当次释放是终局的，分组不会被重新打开。

use thiserror::Error;

use crate::correlation::CorrelationKey;
use crate::message::MessageId;

/// 聚合引擎核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把准入、关联、完整性判定与投递路径上的失败统一为一个枚举，
///   让 [`crate::Aggregator::handle`] 的调用方只需匹配一个类型。
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`，可以跨线程传播；
///   - [`code`](Self::code) 返回的字符串在版本间保持稳定；
///   - 配置类错误（缺少关联键、序列大小不一致、无法解析输出通道）不会被吞掉，总是返回给调用方。
/// - **风险 (Trade-offs)**：关联键与通道名以拥有所有权的形式保存，失败路径会多一次克隆，
///   但换来错误值可以脱离引擎生命周期独立存活。
#[derive(Debug, Error)]
pub enum AggregatorError {
    /// 关联策略无法从消息中提取关联键。
    #[error("message {message_id} carries no correlation key (expected header `{header}`)")]
    MissingCorrelationKey { header: String, message_id: MessageId },

    /// 同一分组内的成员携带了不同的 `sequenceSize`。
    ///
    /// - **契约 (What)**：`expected` 为首个成员声明的大小，`found` 为冲突成员的值；
    ///   触发该错误的消息不会留在分组内。
    #[error("group `{key}` mixes sequenceSize {expected} and {found}")]
    InconsistentSequenceSize {
        key: CorrelationKey,
        expected: u64,
        found: u64,
    },

    /// 释放时既没有输出通道、回复头，也没有丢弃通道可用。
    #[error("group `{key}` has no resolvable reply channel and no discard channel is configured")]
    NoReplyChannel { key: CorrelationKey },

    /// 以名称指定的回复通道无法通过解析器找到。
    #[error("reply channel `{name}` could not be resolved")]
    ChannelResolution { name: String },

    /// 通道返回 `false`，表示拒收。
    #[error("channel `{channel}` refused output of group `{key}`")]
    DeliveryRejected { key: CorrelationKey, channel: String },

    /// 通道在发送时报告错误。
    #[error("delivery of group `{key}` to channel `{channel}` failed")]
    Delivery {
        key: CorrelationKey,
        channel: String,
        #[source]
        source: ChannelError,
    },

    /// 配置项非法。
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 选择器链编辑失败。
    #[error(transparent)]
    Selector(#[from] SelectorError),
}

impl AggregatorError {
    /// 返回稳定的点分错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCorrelationKey { .. } => "aggregator.correlation.missing",
            Self::InconsistentSequenceSize { .. } => "aggregator.sequence.inconsistent",
            Self::NoReplyChannel { .. } => "aggregator.reply.unresolved",
            Self::ChannelResolution { .. } => "aggregator.channel.unresolved",
            Self::DeliveryRejected { .. } => "aggregator.delivery.rejected",
            Self::Delivery { .. } => "aggregator.delivery.failed",
            Self::Config(_) => "aggregator.config.invalid",
            Self::Selector(_) => "aggregator.selector.invalid",
        }
    }

    /// 是否属于需要快速失败的配置类错误。
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingCorrelationKey { .. }
                | Self::InconsistentSequenceSize { .. }
                | Self::NoReplyChannel { .. }
                | Self::ChannelResolution { .. }
                | Self::Config(_)
                | Self::Selector(_)
        )
    }

    /// 是否属于投递失败。
    pub fn is_delivery(&self) -> bool {
        matches!(self, Self::DeliveryRejected { .. } | Self::Delivery { .. })
    }

    /// 返回错误关联的分组键（若有）。
    pub fn correlation_key(&self) -> Option<&CorrelationKey> {
        match self {
            Self::InconsistentSequenceSize { key, .. }
            | Self::NoReplyChannel { key }
            | Self::DeliveryRejected { key, .. }
            | Self::Delivery { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// 配置校验与解析错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 字段取值非法，`reason` 为英文短语。
    #[error("invalid aggregator configuration: `{field}` {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },

    /// TOML 文本无法解析为配置结构。
    #[error("failed to parse aggregator configuration")]
    Parse(#[from] toml::de::Error),
}

/// 选择器链编辑与策略解析错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    /// 在要求至少一个选择器的链上设置了空集合。
    #[error("selector chain requires at least one selector")]
    EmptySelectorSet,

    /// 插入位置越界。
    #[error("selector index {index} is out of bounds for chain of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// 无法识别的投票策略名称。
    #[error("unknown voting strategy `{0}`")]
    UnknownStrategy(String),
}

/// 消息通道发送错误。
///
/// - **契约 (What)**：`channel` 为通道名，便于在日志中定位；
///   返回该错误意味着消息未被通道接收。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// 通道已关闭。
    #[error("channel `{channel}` is closed")]
    Closed { channel: String },

    /// 通道主动拒绝，例如下游校验失败。
    #[error("channel `{channel}` rejected the message: {reason}")]
    Rejected { channel: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_flagged() {
        let err = AggregatorError::NoReplyChannel {
            key: CorrelationKey::from("order-1"),
        };
        assert!(err.is_configuration(), "无回复通道属于配置错误");
        assert!(!err.is_delivery());
        assert_eq!(err.code(), "aggregator.reply.unresolved");

        let err = AggregatorError::DeliveryRejected {
            key: CorrelationKey::from("order-1"),
            channel: "out".into(),
        };
        assert!(err.is_delivery(), "通道拒收属于投递错误");
        assert!(!err.is_configuration());
        assert_eq!(err.correlation_key().map(CorrelationKey::as_str), Some("order-1"));
    }

    #[test]
    fn selector_errors_convert_into_aggregator_error() {
        let err: AggregatorError = SelectorError::EmptySelectorSet.into();
        assert_eq!(err.code(), "aggregator.selector.invalid");
        assert_eq!(err.to_string(), "selector chain requires at least one selector");
    }
}
