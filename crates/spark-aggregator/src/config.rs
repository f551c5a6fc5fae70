//! 聚合器配置。
//!
//! # 教案式说明
//! - **意图 (Why)**：把可序列化的调参项（超时、周期、容量、开关）与不可序列化的协作者
//!   （通道、谓词、处理器）分开；前者可以来自 TOML 文件，后者只能经由
//!   [`crate::AggregatorBuilder`] 注入。
//! - **契约 (What)**：
//!   - 所有字段都有默认值，空 TOML 文本即得到默认配置；
//!   - 未知字段被拒绝，避免拼写错误被静默忽略；
//!   - [`AggregatorConfig::validate`] 在构建聚合器时被调用，非法值快速失败。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::message::headers;
use crate::reply::MemberOrder;

/// 停机时对剩余 `Open` 分组的处理方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// 保持不动，由宿主自行决定。
    #[default]
    Leave,
    /// 以部分结果释放。
    ReleasePartial,
    /// 丢弃到丢弃通道。
    Discard,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregatorConfig {
    /// 分组自创建起的存活上限。
    pub group_timeout_ms: u64,
    /// 回收任务的扫描周期。
    pub reaper_interval_ms: u64,
    /// 超时时是否以部分结果释放；否则丢弃。
    pub send_partial_result_on_timeout: bool,
    /// 同时跟踪的 `Open` 分组上限。
    pub tracked_correlation_id_capacity: usize,
    /// 最近完成关联键的记忆容量，0 表示关闭迟到检测。
    pub completed_key_capacity: usize,
    /// 默认关联策略读取的头部。
    pub correlation_header: String,
    /// 是否丢弃分组内重复的 `sequenceNumber`。
    pub reject_duplicate_sequence_numbers: bool,
    /// 默认处理器的成员排序。
    pub member_order: MemberOrder,
    pub drain_policy: DrainPolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            group_timeout_ms: 60_000,
            reaper_interval_ms: 1_000,
            send_partial_result_on_timeout: false,
            tracked_correlation_id_capacity: 1_000,
            completed_key_capacity: 1_000,
            correlation_header: headers::CORRELATION_ID.to_owned(),
            reject_duplicate_sequence_numbers: true,
            member_order: MemberOrder::Arrival,
            drain_policy: DrainPolicy::Leave,
        }
    }
}

impl AggregatorConfig {
    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reaper_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reaper_interval_ms",
                reason: "must be greater than zero",
            });
        }
        if self.tracked_correlation_id_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tracked_correlation_id_capacity",
                reason: "must be greater than zero",
            });
        }
        if self.correlation_header.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "correlation_header",
                reason: "must not be empty",
            });
        }
        Ok(())
    }

    pub fn group_timeout(&self) -> Duration {
        Duration::from_millis(self.group_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn with_group_timeout(mut self, timeout: Duration) -> Self {
        self.group_timeout_ms = duration_millis(timeout);
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval_ms = duration_millis(interval);
        self
    }

    pub fn with_partial_result_on_timeout(mut self, enabled: bool) -> Self {
        self.send_partial_result_on_timeout = enabled;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.tracked_correlation_id_capacity = capacity;
        self
    }

    pub fn with_completed_key_capacity(mut self, capacity: usize) -> Self {
        self.completed_key_capacity = capacity;
        self
    }

    pub fn with_correlation_header(mut self, header: impl Into<String>) -> Self {
        self.correlation_header = header.into();
        self
    }

    pub fn with_duplicate_rejection(mut self, enabled: bool) -> Self {
        self.reject_duplicate_sequence_numbers = enabled;
        self
    }

    pub fn with_member_order(mut self, order: MemberOrder) -> Self {
        self.member_order = order;
        self
    }

    pub fn with_drain_policy(mut self, policy: DrainPolicy) -> Self {
        self.drain_policy = policy;
        self
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
