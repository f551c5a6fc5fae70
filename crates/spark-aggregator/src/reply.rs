//! 回复构建器与分组处理器。
//!
//! # 教案式说明
//! - **意图 (Why)**：释放分组时，处理器把成员消息加工成若干出站消息；
//!   [`ReplyBuilder`] 是处理器与引擎之间唯一的交接面，处理器不直接接触通道。
//! - **契约 (What)**：
//!   - `ReplyBuilder` 只在一次释放内存活，由持有释放权的线程独占；
//!   - [`ReplyBuilder::set`] 清空已有条目后写入一条，[`ReplyBuilder::add`] 追加；
//!   - 处理器可以覆盖目标通道，覆盖值优先于配置的输出通道与回复头。

use std::borrow::Cow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channel::MessageChannel;
use crate::correlation::CorrelationKey;
use crate::message::{HeaderValue, Message, MessageBuilder, ReplyTarget, headers};

/// 一次释放的出站消息累积器。
#[derive(Debug, Default)]
pub struct ReplyBuilder {
    entries: Vec<MessageBuilder>,
    target: Option<ReplyTarget>,
}

impl ReplyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用单条消息替换当前内容。
    pub fn set(&mut self, entry: MessageBuilder) {
        self.entries.clear();
        self.entries.push(entry);
    }

    pub fn add(&mut self, entry: MessageBuilder) {
        self.entries.push(entry);
    }

    pub fn set_target_channel(&mut self, channel: Arc<dyn MessageChannel>) {
        self.target = Some(ReplyTarget::Channel(channel));
    }

    pub fn set_target_channel_name(&mut self, name: impl Into<Arc<str>>) {
        self.target = Some(ReplyTarget::Name(name.into()));
    }

    pub fn target(&self) -> Option<&ReplyTarget> {
        self.target.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 完成构建，条目按加入顺序生成消息。
    pub fn build(self) -> Reply {
        Reply {
            messages: self.entries.into_iter().map(MessageBuilder::build).collect(),
            target: self.target,
        }
    }
}

/// 构建完成的回复。
#[derive(Debug)]
pub struct Reply {
    messages: Vec<Message>,
    target: Option<ReplyTarget>,
}

impl Reply {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn target(&self) -> Option<&ReplyTarget> {
        self.target.as_ref()
    }

    pub fn into_parts(self) -> (Vec<Message>, Option<ReplyTarget>) {
        (self.messages, self.target)
    }
}

/// 分组处理器：把成员消息写入 [`ReplyBuilder`]。
///
/// - **契约 (What)**：处理器在持有释放权后、不持有任何锁的情况下被调用，
///   同一分组只会被调用一次；不向构建器写入任何条目表示“无输出”。
pub trait GroupProcessor: Send + Sync + 'static {
    fn process(&self, key: &CorrelationKey, members: &[Message], reply: &mut ReplyBuilder);
}

impl<F> GroupProcessor for F
where
    F: Fn(&CorrelationKey, &[Message], &mut ReplyBuilder) + Send + Sync + 'static,
{
    fn process(&self, key: &CorrelationKey, members: &[Message], reply: &mut ReplyBuilder) {
        self(key, members, reply)
    }
}

/// 成员排序方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberOrder {
    /// 按到达顺序。
    #[default]
    Arrival,
    /// 按 `sequenceNumber` 升序，缺失者排在最后并保持到达顺序。
    SequenceNumber,
}

/// 默认处理器：把成员载荷收集为 JSON 数组，作为单条出站消息。
///
/// 出站消息沿用首个成员的关联头部值。
#[derive(Clone, Debug)]
pub struct PayloadListProcessor {
    order: MemberOrder,
    correlation_header: Cow<'static, str>,
}

impl PayloadListProcessor {
    pub fn new(order: MemberOrder, correlation_header: impl Into<Cow<'static, str>>) -> Self {
        Self {
            order,
            correlation_header: correlation_header.into(),
        }
    }
}

impl Default for PayloadListProcessor {
    fn default() -> Self {
        Self::new(MemberOrder::Arrival, headers::CORRELATION_ID)
    }
}

impl GroupProcessor for PayloadListProcessor {
    fn process(&self, key: &CorrelationKey, members: &[Message], reply: &mut ReplyBuilder) {
        let mut ordered: Vec<&Message> = members.iter().collect();
        if self.order == MemberOrder::SequenceNumber {
            ordered.sort_by_key(|member| member.headers().sequence_number().unwrap_or(u64::MAX));
        }
        let payloads = ordered
            .iter()
            .map(|member| member.payload().clone())
            .collect::<Vec<_>>();
        let correlation = members
            .first()
            .and_then(|member| member.header(&self.correlation_header))
            .cloned()
            .unwrap_or_else(|| HeaderValue::String(key.to_string()));

        reply.set(
            MessageBuilder::new(HeaderValue::Array(payloads))
                .header(self.correlation_header.to_string(), correlation),
        );
    }
}
