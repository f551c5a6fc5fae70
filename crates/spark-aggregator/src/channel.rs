//! 消息通道抽象与内存实现。
//!
//! # 教案式说明
//! - **意图 (Why)**：聚合引擎只关心“把消息交给某个目的地”，不关心目的地背后是队列、
//!   网络连接还是下一个处理阶段；以 trait 隔离后，宿主可以接入任意传输。
//! - **契约 (What)**：
//!   - [`MessageChannel::send`] 为同步调用，`Ok(true)` 表示已接收，`Ok(false)` 表示拒收，
//!     `Err` 表示通道自身故障；
//!   - 引擎调用 `send` 时不持有任何内部锁，实现者可以安全地阻塞或回调引擎；
//!   - [`ChannelResolver`] 负责把回复头中的通道名映射到通道对象。
//! - **风险 (Trade-offs)**：同步发送意味着慢通道会拖慢释放它的那个生产者线程，
//!   但不会阻塞其他关联键。

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::ChannelError;
use crate::message::Message;

/// 出站消息的目的地。
pub trait MessageChannel: Send + Sync + 'static {
    /// 通道名，用于日志与名称解析。
    fn name(&self) -> &str;

    /// 发送消息。
    fn send(&self, message: Message) -> Result<bool, ChannelError>;
}

/// 通道名称解析器。
pub trait ChannelResolver: Send + Sync + 'static {
    fn resolve(&self, name: &str) -> Option<Arc<dyn MessageChannel>>;
}

/// 基于 `DashMap` 的通道注册表。
///
/// - **契约 (What)**：注册使用通道自身的 [`MessageChannel::name`] 作为键，重复注册会覆盖旧值并返回它。
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<Arc<str>, Arc<dyn MessageChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: Arc<dyn MessageChannel>) -> Option<Arc<dyn MessageChannel>> {
        let name: Arc<str> = Arc::from(channel.name());
        self.channels.insert(name, channel)
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn MessageChannel>> {
        self.channels.remove(name).map(|(_, channel)| channel)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl ChannelResolver for ChannelRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn MessageChannel>> {
        self.channels.get(name).map(|entry| Arc::clone(entry.value()))
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self
            .channels
            .iter()
            .map(|entry| entry.key().to_string())
            .collect();
        names.sort();
        f.debug_struct("ChannelRegistry").field("channels", &names).finish()
    }
}

/// 内存队列通道。
///
/// # 教案式说明
/// - **意图 (Why)**：为宿主进程内的下游阶段、演示程序与测试提供一个可观测的接收端。
/// - **契约 (What)**：
///   - 有界模式下队列满时 `send` 返回 `Ok(false)`；
///   - [`close`](Self::close) 之后 `send` 返回 [`ChannelError::Closed`]，已入队消息仍可取出。
/// - **执行 (How)**：`parking_lot::Mutex<VecDeque>` 保护队列，关闭位使用原子布尔。
#[derive(Debug)]
pub struct QueueChannel {
    name: String,
    capacity: Option<usize>,
    queue: Mutex<VecDeque<Message>>,
    closed: AtomicBool,
}

impl QueueChannel {
    /// 无界队列。
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            queue: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// 有界队列。
    pub fn bounded(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new(name)
        }
    }

    /// 取出队首消息。
    pub fn receive(&self) -> Option<Message> {
        self.queue.lock().pop_front()
    }

    /// 取出全部已入队消息。
    pub fn drain(&self) -> Vec<Message> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl MessageChannel for QueueChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, message: Message) -> Result<bool, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed {
                channel: self.name.clone(),
            });
        }
        let mut queue = self.queue.lock();
        if self.capacity.is_some_and(|capacity| queue.len() >= capacity) {
            return Ok(false);
        }
        queue.push_back(message);
        Ok(true)
    }
}
