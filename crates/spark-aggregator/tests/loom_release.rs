#![cfg(any(loom, spark_loom))]

//! Loom 模型：分组释放权的互斥抢占。
//!
//! 分组内部使用 `parking_lot`，无法被 Loom 直接插桩；这里以 Loom 原语重建
//! “锁内检查状态 → 跃迁 → 移交成员”的影子模型，状态跃迁规则直接复用 [`GroupState`]。

use loom::{
    model,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};
use spark_aggregator::GroupState;

struct ShadowGroup {
    inner: Mutex<(GroupState, Vec<u32>)>,
    released: AtomicUsize,
    discarded: AtomicUsize,
}

impl ShadowGroup {
    fn new(members: Vec<u32>) -> Self {
        Self {
            inner: Mutex::new((GroupState::Open, members)),
            released: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
        }
    }

    /// 与 `CorrelationGroup::try_claim` 相同的临界区结构。
    fn try_claim(&self, target: GroupState) -> Option<Vec<u32>> {
        let mut inner = self.inner.lock().expect("模型锁不应中毒");
        if !inner.0.can_transition_to(target) {
            return None;
        }
        inner.0 = target;
        Some(std::mem::take(&mut inner.1))
    }

    fn append(&self, member: u32) -> bool {
        let mut inner = self.inner.lock().expect("模型锁不应中毒");
        if !inner.0.is_open() {
            return false;
        }
        inner.1.push(member);
        true
    }
}

#[test]
fn completer_and_reaper_never_both_win() {
    //
    // 教案级说明：完成者与回收者同时抢占同一分组。
    // - **Why**：两者都成功会导致同一关联键既输出又丢弃。
    // - **How**：两个线程分别尝试 `Releasing` 与 `Discarding`，成功者记账。
    // - **What**：任何交错下恰好一方成功，且成功方拿到全部成员。
    model(|| {
        let group = Arc::new(ShadowGroup::new(vec![1, 2]));

        let completer = {
            let group = Arc::clone(&group);
            thread::spawn(move || {
                if let Some(members) = group.try_claim(GroupState::Releasing) {
                    assert_eq!(members, vec![1, 2], "释放方应拿到全部成员");
                    group.released.fetch_add(1, Ordering::AcqRel);
                }
            })
        };
        let reaper = {
            let group = Arc::clone(&group);
            thread::spawn(move || {
                if let Some(members) = group.try_claim(GroupState::Discarding) {
                    assert_eq!(members.len(), 2, "丢弃方应拿到全部成员");
                    group.discarded.fetch_add(1, Ordering::AcqRel);
                }
            })
        };

        completer.join().expect("完成线程不应 panic");
        reaper.join().expect("回收线程不应 panic");
        let wins = group.released.load(Ordering::Acquire) + group.discarded.load(Ordering::Acquire);
        assert_eq!(wins, 1, "释放权必须恰好被抢占一次");
    });
}

#[test]
fn append_after_claim_is_refused() {
    //
    // 教案级说明：抢占与追加交错时，成员要么随抢占被移交，要么被退回给调用方。
    // - **What**：不存在“追加成功但未被任何一方拿走”的成员。
    model(|| {
        let group = Arc::new(ShadowGroup::new(vec![1]));

        let appender = {
            let group = Arc::clone(&group);
            thread::spawn(move || group.append(2))
        };
        let claimed = group.try_claim(GroupState::Releasing).expect("唯一的抢占者必然成功");
        let accepted = appender.join().expect("追加线程不应 panic");

        assert_eq!(claimed.contains(&2), accepted, "成功追加的成员必须出现在移交结果中");
        assert!(group.inner.lock().expect("模型锁不应中毒").1.is_empty());
    });
}
