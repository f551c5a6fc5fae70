use std::collections::{HashSet, VecDeque};

use crate::correlation::CorrelationKey;

/// 最近完成的关联键，容量有界，按先进先出淘汰。
///
/// - **契约 (What)**：容量为 0 时不记录任何键；重复记录同一键不会占用额外容量。
/// - 调用方负责加锁，本结构自身不做同步。
#[derive(Debug)]
pub(crate) struct CompletedKeys {
    capacity: usize,
    order: VecDeque<CorrelationKey>,
    members: HashSet<CorrelationKey>,
}

impl CompletedKeys {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            members: HashSet::with_capacity(capacity.min(1024)),
        }
    }

    pub(crate) fn record(&mut self, key: &CorrelationKey) {
        if self.capacity == 0 || self.members.contains(key) {
            return;
        }
        while self.order.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.members.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.members.insert(key.clone());
    }

    pub(crate) fn contains(&self, key: &CorrelationKey) -> bool {
        self.members.contains(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}
