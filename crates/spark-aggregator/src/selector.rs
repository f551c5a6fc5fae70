//! 选择器与选择器链。
//!
//! # 教案式说明
//! - **意图 (Why)**：准入过滤与完整性判定都可以表达为“若干布尔谓词 + 投票规则”。
//!   [`SelectorChain`] 把两者统一起来：泛型参数 `T` 为单条 [`Message`] 时用于准入，
//!   为 `[Message]` 时用于分组完整性。
//! - **契约 (What)**：
//!   - 评估总是针对某一时刻的完整快照进行：并发编辑不会让一次评估看到“半个列表”；
//!   - 策略与选择器列表可以在运行时修改，后续评估立即生效；
//!   - 空链在 `All` 下接受，在其余策略下拒绝；
//!   - 选择器只做纯粹的只读判断，评估过程不会改变主体。
//! - **执行 (How)**：选择器列表存放在 `ArcSwap<Vec<_>>` 中，编辑走写时复制；
//!   策略使用单字节原子量存储。
//! - **风险 (Trade-offs)**：每次编辑都会复制整个列表，适合“读多写少”的场景。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::SelectorError;
use crate::message::{HeaderValue, Message};

/// 针对主体 `T` 的布尔谓词。
pub trait MessageSelector<T: ?Sized = Message>: Send + Sync + 'static {
    fn accept(&self, subject: &T) -> bool;
}

impl<T, F> MessageSelector<T> for F
where
    T: ?Sized,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn accept(&self, subject: &T) -> bool {
        self(subject)
    }
}

/// 投票策略。
///
/// - `All`：全部接受才通过，空链通过；
/// - `Any`：至少一个接受即通过，空链不通过；
/// - `MoreThanHalf`：`2 * accepted > total`；
/// - `AtLeastHalf`：`2 * accepted >= total`。
///
/// 阈值类策略在 `accepted == 0` 时总是不通过。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingStrategy {
    #[default]
    All,
    Any,
    MoreThanHalf,
    AtLeastHalf,
}

impl VotingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Any => "any",
            Self::MoreThanHalf => "more_than_half",
            Self::AtLeastHalf => "at_least_half",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::All => 0,
            Self::Any => 1,
            Self::MoreThanHalf => 2,
            Self::AtLeastHalf => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Any,
            2 => Self::MoreThanHalf,
            3 => Self::AtLeastHalf,
            _ => Self::All,
        }
    }
}

impl fmt::Display for VotingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VotingStrategy {
    type Err = SelectorError;

    /// 大小写不敏感，`-` 与 `_` 等价；空串与未知名称均被拒绝。
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            "more_than_half" => Ok(Self::MoreThanHalf),
            "at_least_half" => Ok(Self::AtLeastHalf),
            _ => Err(SelectorError::UnknownStrategy(raw.to_owned())),
        }
    }
}

/// 一次评估的完整计票结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelectorVote {
    pub accepted: usize,
    pub total: usize,
}

impl SelectorVote {
    pub fn rejected(&self) -> usize {
        self.total - self.accepted
    }

    /// 依据策略给出结论。
    pub fn decide(&self, strategy: VotingStrategy) -> bool {
        match strategy {
            VotingStrategy::All => self.accepted == self.total,
            VotingStrategy::Any => self.accepted > 0,
            VotingStrategy::MoreThanHalf => self.accepted > 0 && 2 * self.accepted > self.total,
            VotingStrategy::AtLeastHalf => self.accepted > 0 && 2 * self.accepted >= self.total,
        }
    }
}

type SelectorList<T> = Vec<Arc<dyn MessageSelector<T>>>;

struct ChainState<T: ?Sized + 'static> {
    selectors: ArcSwap<SelectorList<T>>,
    strategy: AtomicU8,
    require_selectors: bool,
}

/// 有序的选择器列表 + 投票策略。
///
/// # 教案式说明
/// - **意图 (Why)**：在不停止流量的前提下调整过滤规则。
/// - **契约 (What)**：
///   - `SelectorChain` 是共享句柄，克隆后的实例编辑同一份列表；
///   - [`accept`](Self::accept) 在 `All`/`Any` 策略下短路求值，其余策略完整计票；
///   - [`add_at`](Self::add_at) 越界返回 [`SelectorError::IndexOutOfBounds`]；
///   - 通过 [`requiring_selectors`](Self::requiring_selectors) 构造的链拒绝被设置为空集合。
/// - **执行 (How)**：`add` 使用 `ArcSwap::rcu` 重试；`add_at` 需要先验证下标，
///   因此手写 compare-and-swap 循环。
pub struct SelectorChain<T: ?Sized + 'static = Message> {
    state: Arc<ChainState<T>>,
}

impl<T: ?Sized + 'static> Clone for SelectorChain<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: ?Sized + 'static> Default for SelectorChain<T> {
    fn default() -> Self {
        Self::new(VotingStrategy::default())
    }
}

impl<T: ?Sized + 'static> SelectorChain<T> {
    pub fn new(strategy: VotingStrategy) -> Self {
        Self {
            state: Arc::new(ChainState {
                selectors: ArcSwap::from_pointee(Vec::new()),
                strategy: AtomicU8::new(strategy.to_u8()),
                require_selectors: false,
            }),
        }
    }

    /// 构造一条必须至少包含一个选择器的链。
    pub fn requiring_selectors(
        strategy: VotingStrategy,
        selectors: impl IntoIterator<Item = Arc<dyn MessageSelector<T>>>,
    ) -> Result<Self, SelectorError> {
        let selectors: SelectorList<T> = selectors.into_iter().collect();
        if selectors.is_empty() {
            return Err(SelectorError::EmptySelectorSet);
        }
        Ok(Self {
            state: Arc::new(ChainState {
                selectors: ArcSwap::from_pointee(selectors),
                strategy: AtomicU8::new(strategy.to_u8()),
                require_selectors: true,
            }),
        })
    }

    /// 对主体求值。
    pub fn accept(&self, subject: &T) -> bool {
        let selectors = self.state.selectors.load();
        match self.strategy() {
            VotingStrategy::All => selectors.iter().all(|selector| selector.accept(subject)),
            VotingStrategy::Any => selectors.iter().any(|selector| selector.accept(subject)),
            strategy => tally(&selectors, subject).decide(strategy),
        }
    }

    /// 完整计票，不短路。
    pub fn vote(&self, subject: &T) -> SelectorVote {
        tally(&self.state.selectors.load(), subject)
    }

    /// 在末尾追加选择器。
    pub fn add<S>(&self, selector: S)
    where
        S: MessageSelector<T>,
    {
        self.add_shared(Arc::new(selector));
    }

    pub fn add_shared(&self, selector: Arc<dyn MessageSelector<T>>) {
        self.state.selectors.rcu(|current| {
            let mut next: SelectorList<T> = (**current).clone();
            next.push(Arc::clone(&selector));
            next
        });
    }

    /// 在指定位置插入选择器，`index == len` 等价于追加。
    pub fn add_at<S>(&self, index: usize, selector: S) -> Result<(), SelectorError>
    where
        S: MessageSelector<T>,
    {
        let selector: Arc<dyn MessageSelector<T>> = Arc::new(selector);
        loop {
            let current = self.state.selectors.load_full();
            if index > current.len() {
                return Err(SelectorError::IndexOutOfBounds {
                    index,
                    len: current.len(),
                });
            }
            let mut next: SelectorList<T> = (*current).clone();
            next.insert(index, Arc::clone(&selector));
            let previous = self.state.selectors.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&*previous, &current) {
                return Ok(());
            }
        }
    }

    /// 整体替换选择器列表。
    pub fn set_selectors(
        &self,
        selectors: impl IntoIterator<Item = Arc<dyn MessageSelector<T>>>,
    ) -> Result<(), SelectorError> {
        let selectors: SelectorList<T> = selectors.into_iter().collect();
        if selectors.is_empty() && self.state.require_selectors {
            return Err(SelectorError::EmptySelectorSet);
        }
        self.state.selectors.store(Arc::new(selectors));
        Ok(())
    }

    pub fn set_strategy(&self, strategy: VotingStrategy) {
        self.state.strategy.store(strategy.to_u8(), Ordering::Release);
    }

    /// 以名称设置策略，未知名称不会改变当前策略。
    pub fn set_strategy_name(&self, name: &str) -> Result<(), SelectorError> {
        self.set_strategy(name.parse()?);
        Ok(())
    }

    pub fn strategy(&self) -> VotingStrategy {
        VotingStrategy::from_u8(self.state.strategy.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.state.selectors.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.selectors.load().is_empty()
    }
}

fn tally<T: ?Sized + 'static>(selectors: &SelectorList<T>, subject: &T) -> SelectorVote {
    let accepted = selectors
        .iter()
        .filter(|selector| selector.accept(subject))
        .count();
    SelectorVote {
        accepted,
        total: selectors.len(),
    }
}

impl<T: ?Sized + 'static> fmt::Debug for SelectorChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorChain")
            .field("strategy", &self.strategy())
            .field("selectors", &self.len())
            .field("require_selectors", &self.state.require_selectors)
            .finish()
    }
}

impl<T: ?Sized + 'static> MessageSelector<T> for SelectorChain<T> {
    fn accept(&self, subject: &T) -> bool {
        SelectorChain::accept(self, subject)
    }
}

/// 基于头部的常用选择器。
#[derive(Clone, Debug, PartialEq)]
pub enum HeaderSelector {
    /// 头部存在。
    Present(String),
    /// 头部存在且等于给定值。
    Equals(String, HeaderValue),
}

impl HeaderSelector {
    pub fn present(name: impl Into<String>) -> Self {
        Self::Present(name.into())
    }

    pub fn equals(name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        Self::Equals(name.into(), value.into())
    }
}

impl MessageSelector<Message> for HeaderSelector {
    fn accept(&self, message: &Message) -> bool {
        match self {
            Self::Present(name) => message.headers().contains(name),
            Self::Equals(name, expected) => message.header(name) == Some(expected),
        }
    }
}
