//! # GroupStore：关联键到分组的有界仓储
//!
//! ## 核心意图（Why）
//! - 并发生产者通过同一个仓储找到（或创建）关联键对应的分组；
//! - 仓储容量有界，满载时按创建顺序驱逐最老的 `Open` 分组，防止未完成的键无限堆积；
//! - 记录最近完成的关联键，让迟到消息可以被识别，而不是悄悄开启第二个分组。
//!
//! ## 行为契约（What）
//! - [`GroupStore::get_or_create`]：同一关联键的并发调用最多只创建一个分组；
//! - [`GroupStore::remove`]/[`GroupStore::retire`]：幂等，且 `retire` 只移除同一代次的分组；
//! - [`GroupStore::snapshot`]：返回调用时刻的分组列表，后续变更不影响快照；
//! - 调用方永远拿不到内部映射的引用。
//!
//! ## 执行细节（How）
//! - 已存在的键走 `DashMap` 读路径，不进入全局临界区；
//! - 新键进入 `parking_lot::Mutex` 保护的创建临界区：复查映射、检查完成记录、按需驱逐、插入；
//! - `retire` 同样在临界区内“记录完成键 + 移除”，因此创建路径不会在两步之间插入新分组。
//!
//! ## 风险提示（Trade-offs）
//! - 驱逐只跳过正在释放的分组而不等待它们，释放中的分组较多时仓储会暂时超过容量，
//!   超出量不超过尚未 `retire` 的释放中分组数；
//! - 创建顺序队列中会残留已移除分组的条目，超过两倍容量时整体压缩一次。

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{Claim, ClaimedGroup, CompletedKeys, CorrelationGroup, DiscardReason, GroupId};
use crate::correlation::CorrelationKey;

/// 取得分组的结果。
#[derive(Debug)]
pub enum Admission {
    /// 关联键已有分组。
    Existing(Arc<CorrelationGroup>),
    /// 新建了分组；`evicted` 为腾出空间而被抢占的旧分组，调用方负责丢弃它们。
    Created {
        group: Arc<CorrelationGroup>,
        evicted: Vec<ClaimedGroup>,
    },
    /// 关联键最近已完成，不再创建分组。
    Completed,
}

#[derive(Debug)]
struct Section {
    order: VecDeque<(CorrelationKey, GroupId)>,
    completed: CompletedKeys,
    next_id: u64,
}

/// 有界分组仓储。
#[derive(Debug)]
pub struct GroupStore {
    groups: DashMap<CorrelationKey, Arc<CorrelationGroup>>,
    section: Mutex<Section>,
    capacity: AtomicUsize,
}

impl GroupStore {
    /// 创建仓储。`capacity` 为 0 时按 1 处理；`completed_key_capacity` 为 0 时关闭迟到检测。
    pub fn new(capacity: usize, completed_key_capacity: usize) -> Self {
        Self {
            groups: DashMap::new(),
            section: Mutex::new(Section {
                order: VecDeque::new(),
                completed: CompletedKeys::new(completed_key_capacity),
                next_id: 0,
            }),
            capacity: AtomicUsize::new(capacity.max(1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// 调整容量，下一次创建分组时按新容量驱逐。
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, key: &CorrelationKey) -> Option<Arc<CorrelationGroup>> {
        self.groups.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.groups.contains_key(key)
    }

    /// 关联键是否在最近完成记录中。
    pub fn is_completed(&self, key: &CorrelationKey) -> bool {
        self.section.lock().completed.contains(key)
    }

    /// 取得或创建分组。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 已存在：返回同一个 `Arc`，不触碰临界区；
    ///   - 最近完成：返回 [`Admission::Completed`]；
    ///   - 否则：必要时驱逐最老的 `Open` 分组，插入新分组并返回。
    /// - **执行 (How)**：驱逐先抢占旧分组的释放权再从映射中移除，
    ///   抢占失败说明它正在被释放，直接跳过。
    pub fn get_or_create(&self, key: &CorrelationKey, now: Instant) -> Admission {
        if let Some(existing) = self.get(key) {
            return Admission::Existing(existing);
        }

        let mut section = self.section.lock();
        if let Some(existing) = self.get(key) {
            return Admission::Existing(existing);
        }
        if section.completed.contains(key) {
            return Admission::Completed;
        }

        let capacity = self.capacity();
        let mut evicted = Vec::new();
        while self.groups.len() >= capacity {
            let Some((victim_key, victim_id)) = section.order.pop_front() else {
                break;
            };
            let Some(victim) = self.get(&victim_key).filter(|group| group.id() == victim_id) else {
                continue;
            };
            if let Some(claimed) = victim.try_claim(Claim::Discard(DiscardReason::Evicted)) {
                self.groups
                    .remove_if(&victim_key, |_, current| current.id() == victim_id);
                evicted.push(claimed);
            }
        }

        section.next_id += 1;
        let id = GroupId::new(section.next_id);
        let group = Arc::new(CorrelationGroup::new(id, key.clone(), now));
        self.groups.insert(key.clone(), Arc::clone(&group));
        section.order.push_back((key.clone(), id));

        if section.order.len() > capacity.saturating_mul(2) {
            section.order.retain(|(key, id)| {
                self.groups
                    .get(key)
                    .is_some_and(|entry| entry.value().id() == *id)
            });
        }

        Admission::Created { group, evicted }
    }

    /// 无条件移除关联键当前的分组。
    pub fn remove(&self, key: &CorrelationKey) -> bool {
        self.groups.remove(key).is_some()
    }

    /// 移除指定代次的分组，可选地把关联键记入完成记录。
    ///
    /// 分组已被移除或已被新代次替换时仍会记录完成键，返回值表示本次是否真正移除。
    pub fn retire(&self, group: &CorrelationGroup, track_completion: bool) -> bool {
        let mut section = self.section.lock();
        if track_completion {
            section.completed.record(group.key());
        }
        self.groups
            .remove_if(group.key(), |_, current| current.id() == group.id())
            .is_some()
    }

    /// 当前全部分组的快照，按创建先后排序。
    pub fn snapshot(&self) -> Vec<Arc<CorrelationGroup>> {
        let mut groups: Vec<_> = self
            .groups
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        groups.sort_by_key(|group| group.id());
        groups
    }
}
