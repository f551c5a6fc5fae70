//! # group 模块：关联分组与分组仓储
//!
//! ## 核心意图（Why）
//! - [`CorrelationGroup`] 是“某个关联键的一次聚合尝试”，其状态机保证释放权只会被授予一次；
//! - [`GroupStore`] 以有界、并发安全的方式维护“关联键 → 分组”的映射。
//!
//! ## 状态图（What）
//! ```text
//! Open ──完整/超时(部分释放)/停机──▶ Releasing ──投递结束──▶ Released
//!   └────超时/驱逐/停机─────────▶ Discarding ──丢弃结束──▶ Discarded
//! ```
//! - 只有 `Open` 可以追加成员；
//! - 离开 `Open` 的那一次状态修改就是“抢占释放权”，在分组互斥锁内完成，
//!   完整性路径与回收路径谁先拿到锁谁获胜，另一方观察到非 `Open` 后退出。
//!
//! ## 锁顺序
//! - 仓储创建临界区 → 分组互斥锁；反向获取是被禁止的。

mod store;
mod tracker;

pub use store::{Admission, GroupStore};
pub(crate) use tracker::CompletedKeys;

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::correlation::CorrelationKey;
use crate::error::AggregatorError;
use crate::message::Message;

/// 仓储内单调递增的分组代次编号。
///
/// 同一关联键在释放后可能重新创建分组，代次编号用于区分新旧实例。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u64);

impl GroupId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// 分组生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupState {
    Open,
    Releasing,
    Released,
    Discarding,
    Discarded,
}

impl GroupState {
    /// 判断状态是否允许跃迁至 `target`。
    pub fn can_transition_to(self, target: GroupState) -> bool {
        matches!(
            (self, target),
            (GroupState::Open, GroupState::Releasing)
                | (GroupState::Open, GroupState::Discarding)
                | (GroupState::Releasing, GroupState::Released)
                | (GroupState::Discarding, GroupState::Discarded)
        )
    }

    pub fn is_open(self) -> bool {
        matches!(self, GroupState::Open)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GroupState::Released | GroupState::Discarded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GroupState::Open => "open",
            GroupState::Releasing => "releasing",
            GroupState::Released => "released",
            GroupState::Discarding => "discarding",
            GroupState::Discarded => "discarded",
        }
    }
}

/// 分组被丢弃的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// 超时且未开启部分释放。
    Timeout,
    /// 仓储满载时为新键腾出空间。
    Evicted,
    /// 停机排空时按策略丢弃。
    Shutdown,
    /// 分组在首个成员追加之前就被关闭（超时或停机时为空）。
    Abandoned,
}

impl DiscardReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscardReason::Timeout => "timeout",
            DiscardReason::Evicted => "evicted",
            DiscardReason::Shutdown => "shutdown",
            DiscardReason::Abandoned => "abandoned",
        }
    }

    /// 关联键是否应记入完成记录。
    ///
    /// 驱逐与空分组都没有交付过任何成员，同一关联键的后续消息应开启新分组。
    pub fn tracks_completion(self) -> bool {
        matches!(self, DiscardReason::Timeout | DiscardReason::Shutdown)
    }
}

/// 分组被释放的触发来源。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReleaseTrigger {
    /// 完整性判定通过。
    Complete,
    /// 超时后部分释放。
    Timeout,
    /// 停机排空时部分释放。
    Shutdown,
}

impl ReleaseTrigger {
    pub fn is_partial(self) -> bool {
        !matches!(self, ReleaseTrigger::Complete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseTrigger::Complete => "complete",
            ReleaseTrigger::Timeout => "timeout",
            ReleaseTrigger::Shutdown => "shutdown",
        }
    }
}

/// 抢占释放权时选择的去向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claim {
    Release(ReleaseTrigger),
    Discard(DiscardReason),
}

impl Claim {
    fn target_state(self) -> GroupState {
        match self {
            Claim::Release(_) => GroupState::Releasing,
            Claim::Discard(_) => GroupState::Discarding,
        }
    }
}

/// 成功抢占释放权后得到的所有权凭证。
///
/// - **契约 (What)**：持有者是唯一可以处理 `members` 的线程；
///   处理结束后由聚合器把分组推进到终态并从仓储中移除。
#[derive(Debug)]
pub struct ClaimedGroup {
    group: Arc<CorrelationGroup>,
    claim: Claim,
    members: Vec<Message>,
}

impl ClaimedGroup {
    pub fn group(&self) -> &Arc<CorrelationGroup> {
        &self.group
    }

    pub fn key(&self) -> &CorrelationKey {
        &self.group.key
    }

    pub fn claim(&self) -> Claim {
        self.claim
    }

    pub fn members(&self) -> &[Message] {
        &self.members
    }

    pub(crate) fn into_parts(self) -> (Arc<CorrelationGroup>, Claim, Vec<Message>) {
        (self.group, self.claim, self.members)
    }
}

/// 追加成员的结果。
#[derive(Debug)]
pub enum AppendOutcome {
    /// 已缓冲，分组仍为 `Open`。
    Buffered { size: usize },
    /// 本次追加使分组完整，调用方获得释放权。
    Complete(ClaimedGroup),
    /// 同一 `sequenceNumber` 已存在，消息被退回。
    Duplicate(Message),
    /// 分组已不再接受成员，消息被退回。
    Closed {
        state: GroupState,
        discard_reason: Option<DiscardReason>,
        message: Message,
    },
}

#[derive(Debug)]
struct GroupInner {
    state: GroupState,
    members: Vec<Message>,
    claim: Option<Claim>,
}

/// 单个关联键的聚合分组。
///
/// # 教案式说明
/// - **意图 (Why)**：把“追加 + 判定 + 抢占”压缩进一次加锁，保证判定看到的成员集合
///   恰好包含刚追加的消息，且释放权只授予一次。
/// - **契约 (What)**：
///   - `key`、`id`、`created_at` 创建后不变；
///   - 成员列表按追加顺序保存，只在 `Open` 状态下增长；
///   - 抢占成功后成员列表被移交给 [`ClaimedGroup`]，分组本身只保留状态。
/// - **风险 (Trade-offs)**：完整性判定在锁内运行，慢判定会阻塞同一分组的其他生产者，
///   但不会影响其他关联键。
#[derive(Debug)]
pub struct CorrelationGroup {
    id: GroupId,
    key: CorrelationKey,
    created_at: Instant,
    inner: Mutex<GroupInner>,
}

impl CorrelationGroup {
    pub(crate) fn new(id: GroupId, key: CorrelationKey, created_at: Instant) -> Self {
        Self {
            id,
            key,
            created_at,
            inner: Mutex::new(GroupInner {
                state: GroupState::Open,
                members: Vec::new(),
                claim: None,
            }),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> GroupState {
        self.inner.lock().state
    }

    /// 当前成员数；抢占之后为 0。
    pub fn len(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().members.is_empty()
    }

    /// 成员快照。
    pub fn members(&self) -> Vec<Message> {
        self.inner.lock().members.clone()
    }

    /// 若已被丢弃或正在丢弃，返回原因。
    pub fn discard_reason(&self) -> Option<DiscardReason> {
        match self.inner.lock().claim {
            Some(Claim::Discard(reason)) => Some(reason),
            _ => None,
        }
    }

    /// 自创建起是否已达到 `timeout`。
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= timeout
    }

    /// 追加成员并在同一临界区内判定完整性。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 非 `Open` 时原样退回消息；
    ///   - `reject_duplicates` 为真且同序号成员已存在时退回消息；
    ///   - 判定返回 `Err` 时撤回本次追加并传播错误；
    ///   - 判定返回 `Ok(true)` 时状态变为 `Releasing` 并移交成员。
    pub(crate) fn append<F>(
        self: &Arc<Self>,
        message: Message,
        reject_duplicates: bool,
        is_complete: F,
    ) -> Result<AppendOutcome, AggregatorError>
    where
        F: FnOnce(&[Message]) -> Result<bool, AggregatorError>,
    {
        let mut inner = self.inner.lock();
        if !inner.state.is_open() {
            let discard_reason = match inner.claim {
                Some(Claim::Discard(reason)) => Some(reason),
                _ => None,
            };
            return Ok(AppendOutcome::Closed {
                state: inner.state,
                discard_reason,
                message,
            });
        }
        if reject_duplicates {
            if let Some(number) = message.headers().sequence_number() {
                let taken = inner
                    .members
                    .iter()
                    .any(|member| member.headers().sequence_number() == Some(number));
                if taken {
                    return Ok(AppendOutcome::Duplicate(message));
                }
            }
        }

        inner.members.push(message);
        match is_complete(&inner.members) {
            Ok(true) => {
                let claim = Claim::Release(ReleaseTrigger::Complete);
                let members = Self::seize(&mut inner, claim);
                Ok(AppendOutcome::Complete(self.claimed(claim, members)))
            }
            Ok(false) => Ok(AppendOutcome::Buffered {
                size: inner.members.len(),
            }),
            Err(err) => {
                inner.members.pop();
                Err(err)
            }
        }
    }

    /// 在分组锁内决定是否抢占释放权。
    ///
    /// `decide` 只在分组仍为 `Open` 时被调用，返回 `None` 表示放弃。
    pub(crate) fn try_claim_with<F>(self: &Arc<Self>, decide: F) -> Option<ClaimedGroup>
    where
        F: FnOnce(&[Message]) -> Option<Claim>,
    {
        let mut inner = self.inner.lock();
        if !inner.state.is_open() {
            return None;
        }
        let claim = decide(&inner.members)?;
        let members = Self::seize(&mut inner, claim);
        Some(self.claimed(claim, members))
    }

    pub(crate) fn try_claim(self: &Arc<Self>, claim: Claim) -> Option<ClaimedGroup> {
        self.try_claim_with(|_| Some(claim))
    }

    /// 把分组推进到终态。对已处于终态的分组无效果。
    pub(crate) fn finish(&self) -> GroupState {
        let mut inner = self.inner.lock();
        let terminal = match inner.state {
            GroupState::Releasing => GroupState::Released,
            GroupState::Discarding => GroupState::Discarded,
            other => return other,
        };
        debug_assert!(inner.state.can_transition_to(terminal));
        inner.state = terminal;
        terminal
    }

    fn seize(inner: &mut GroupInner, claim: Claim) -> Vec<Message> {
        let target = claim.target_state();
        debug_assert!(inner.state.can_transition_to(target));
        inner.state = target;
        inner.claim = Some(claim);
        mem::take(&mut inner.members)
    }

    fn claimed(self: &Arc<Self>, claim: Claim, members: Vec<Message>) -> ClaimedGroup {
        ClaimedGroup {
            group: Arc::clone(self),
            claim,
            members,
        }
    }
}
