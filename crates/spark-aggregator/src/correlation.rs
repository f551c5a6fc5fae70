//! 关联键与关联策略。

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::message::{HeaderValue, Message, headers};

/// 分组标识。
///
/// - **契约 (What)**：字符串头部值原样使用；数字、布尔与结构化值使用其 JSON 文本；
///   `null` 不构成关联键。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey(Arc<str>);

impl CorrelationKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn from_header_value(value: &HeaderValue) -> Option<Self> {
        match value {
            HeaderValue::Null => None,
            HeaderValue::String(text) => Some(Self::new(text.as_str())),
            other => Some(Self::new(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CorrelationKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

/// 从消息中提取关联键的策略。
pub trait CorrelationStrategy: Send + Sync + 'static {
    fn correlation_key(&self, message: &Message) -> Option<CorrelationKey>;

    /// 用于错误信息的描述，默认为 `"custom"`。
    fn describe(&self) -> Cow<'_, str> {
        Cow::Borrowed("custom")
    }
}

impl<F> CorrelationStrategy for F
where
    F: Fn(&Message) -> Option<CorrelationKey> + Send + Sync + 'static,
{
    fn correlation_key(&self, message: &Message) -> Option<CorrelationKey> {
        self(message)
    }
}

/// 按头部取值的关联策略，默认读取 `correlationId`。
#[derive(Clone, Debug)]
pub struct HeaderCorrelation {
    header: Cow<'static, str>,
}

impl HeaderCorrelation {
    pub fn new(header: impl Into<Cow<'static, str>>) -> Self {
        Self {
            header: header.into(),
        }
    }

    pub fn header_name(&self) -> &str {
        &self.header
    }
}

impl Default for HeaderCorrelation {
    fn default() -> Self {
        Self::new(headers::CORRELATION_ID)
    }
}

impl CorrelationStrategy for HeaderCorrelation {
    fn correlation_key(&self, message: &Message) -> Option<CorrelationKey> {
        message
            .header(&self.header)
            .and_then(CorrelationKey::from_header_value)
    }

    fn describe(&self) -> Cow<'_, str> {
        Cow::Borrowed(&*self.header)
    }
}
