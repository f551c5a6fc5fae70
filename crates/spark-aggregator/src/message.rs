//! 消息模型：不可变的载荷 + 头部集合。
//!
//! # 教案式说明
//! - **意图 (Why)**：聚合引擎在多个线程之间传递同一条消息（分组缓冲、处理器、丢弃通道），
//!   使用 `Arc` 共享的不可变结构可以让克隆只是一次引用计数递增。
//! - **契约 (What)**：
//!   - 载荷与头部值统一使用 [`serde_json::Value`]，宿主可以承载任意结构化数据；
//!   - 每条消息在构建时分配进程内唯一的 [`MessageId`]；
//!   - 修改消息只能通过 [`MessageBuilder::from_message`] 复制出新消息。
//! - **风险 (Trade-offs)**：回复通道以类型化字段保存在头部中，而不是 JSON 值，
//!   因为通道对象本身不可序列化。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::channel::MessageChannel;

/// 头部值类型。
pub type HeaderValue = serde_json::Value;

/// 载荷类型。
pub type Payload = serde_json::Value;

/// 聚合引擎识别的标准头部名称。
pub mod headers {
    /// 默认关联键头部。
    pub const CORRELATION_ID: &str = "correlationId";
    /// 成员在序列中的位置（从 1 开始）。
    pub const SEQUENCE_NUMBER: &str = "sequenceNumber";
    /// 序列声明的成员总数。
    pub const SEQUENCE_SIZE: &str = "sequenceSize";
}

/// 进程内唯一的消息编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// 返回原始数值。
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 回复目标：直接持有通道，或以名称延迟解析。
#[derive(Clone)]
pub enum ReplyTarget {
    Channel(Arc<dyn MessageChannel>),
    Name(Arc<str>),
}

impl ReplyTarget {
    /// 以名称构造回复目标。
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self::Name(name.into())
    }

    /// 判断目标是否就是给定通道。
    ///
    /// 名称目标与通道名比较；通道目标比较对象地址。
    pub fn refers_to(&self, channel: &Arc<dyn MessageChannel>) -> bool {
        match self {
            Self::Channel(target) => same_channel(target, channel),
            Self::Name(name) => name.as_ref() == channel.name(),
        }
    }
}

pub(crate) fn same_channel(a: &Arc<dyn MessageChannel>, b: &Arc<dyn MessageChannel>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl fmt::Debug for ReplyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(channel) => f.debug_tuple("Channel").field(&channel.name()).finish(),
            Self::Name(name) => f.debug_tuple("Name").field(name).finish(),
        }
    }
}

/// 消息头部集合。
#[derive(Clone, Debug, Default)]
pub struct MessageHeaders {
    values: BTreeMap<String, HeaderValue>,
    reply_channel: Option<ReplyTarget>,
}

impl MessageHeaders {
    /// 读取头部值。
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.values.get(name)
    }

    /// 是否包含指定头部。
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// 按名称顺序遍历头部。
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.reply_channel.is_none()
    }

    /// 默认关联头部的值。
    pub fn correlation_id(&self) -> Option<&HeaderValue> {
        self.get(headers::CORRELATION_ID)
    }

    /// 解析 `sequenceNumber`，接受数字或数字字符串。
    pub fn sequence_number(&self) -> Option<u64> {
        self.get(headers::SEQUENCE_NUMBER).and_then(as_u64)
    }

    /// 解析 `sequenceSize`，接受数字或数字字符串。
    pub fn sequence_size(&self) -> Option<u64> {
        self.get(headers::SEQUENCE_SIZE).and_then(as_u64)
    }

    /// 回复目标。
    pub fn reply_channel(&self) -> Option<&ReplyTarget> {
        self.reply_channel.as_ref()
    }
}

fn as_u64(value: &HeaderValue) -> Option<u64> {
    match value {
        HeaderValue::Number(number) => number.as_u64(),
        HeaderValue::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug)]
struct MessageInner {
    id: MessageId,
    payload: Payload,
    headers: MessageHeaders,
}

/// 不可变消息句柄，克隆只增加引用计数。
#[derive(Clone, Debug)]
pub struct Message {
    inner: Arc<MessageInner>,
}

impl Message {
    /// 以空头部构造消息。
    pub fn new(payload: impl Into<Payload>) -> Self {
        MessageBuilder::new(payload).build()
    }

    /// 返回构建器。
    pub fn builder(payload: impl Into<Payload>) -> MessageBuilder {
        MessageBuilder::new(payload)
    }

    pub fn id(&self) -> MessageId {
        self.inner.id
    }

    pub fn payload(&self) -> &Payload {
        &self.inner.payload
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.inner.headers
    }

    /// `headers().get(name)` 的简写。
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.inner.headers.get(name)
    }
}

/// 消息构建器。
///
/// # 教案式说明
/// - **意图 (Why)**：处理器需要基于原始成员派生出站消息，例如补充回复通道头；
///   构建器是唯一允许“修改”消息的入口。
/// - **契约 (What)**：[`build`](Self::build) 总会分配新的 [`MessageId`]；
///   `*_if_absent` 系列方法不会覆盖已有值。
#[derive(Clone, Debug)]
pub struct MessageBuilder {
    payload: Payload,
    headers: MessageHeaders,
}

impl MessageBuilder {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            headers: MessageHeaders::default(),
        }
    }

    /// 复制已有消息的载荷与全部头部。
    pub fn from_message(message: &Message) -> Self {
        Self {
            payload: message.payload().clone(),
            headers: message.headers().clone(),
        }
    }

    pub fn payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    /// 设置头部，已有值会被覆盖。
    pub fn header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.values.insert(name.into(), value.into());
        self
    }

    pub fn header_if_absent(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.values.entry(name.into()).or_insert_with(|| value.into());
        self
    }

    pub fn remove_header(mut self, name: &str) -> Self {
        self.headers.values.remove(name);
        self
    }

    pub fn correlation_id(self, value: impl Into<HeaderValue>) -> Self {
        self.header(headers::CORRELATION_ID, value)
    }

    /// 同时设置 `sequenceNumber` 与 `sequenceSize`。
    pub fn sequence(self, number: u64, size: u64) -> Self {
        self.header(headers::SEQUENCE_NUMBER, number)
            .header(headers::SEQUENCE_SIZE, size)
    }

    pub fn reply_channel(mut self, target: ReplyTarget) -> Self {
        self.headers.reply_channel = Some(target);
        self
    }

    pub fn reply_channel_if_absent(mut self, target: ReplyTarget) -> Self {
        self.headers.reply_channel.get_or_insert(target);
        self
    }

    pub fn build(self) -> Message {
        Message {
            inner: Arc::new(MessageInner {
                id: MessageId::next(),
                payload: self.payload,
                headers: self.headers,
            }),
        }
    }
}
