//! 分组完整性判定。
//!
//! # 教案式说明
//! - **意图 (Why)**：决定“一个分组什么时候可以释放”是聚合器最常被定制的部分，
//!   以 trait 暴露后，宿主可以按序列大小、按选择器投票或按任意业务规则判定。
//! - **契约 (What)**：
//!   - 判定在分组互斥锁内执行，实现必须快速返回且不得回调聚合器；
//!   - 返回 `Err` 时，本次追加的消息会被撤回，错误原样交给调用方；
//!   - 默认实现为 [`SequenceSizeCompletion`]。

use crate::correlation::CorrelationKey;
use crate::error::AggregatorError;
use crate::message::Message;
use crate::selector::SelectorChain;

/// 完整性判定策略。
pub trait CompletionPolicy: Send + Sync + 'static {
    fn is_complete(&self, key: &CorrelationKey, members: &[Message]) -> Result<bool, AggregatorError>;
}

/// 按 `sequenceSize` 判定：每个成员都声明了相同的大小，且成员数等于该大小。
///
/// - **契约 (What)**：任一成员缺少 `sequenceSize` 时返回 `Ok(false)`，分组只能等待超时；
///   成员之间声明的大小不同时返回 [`AggregatorError::InconsistentSequenceSize`]。
#[derive(Clone, Copy, Debug, Default)]
pub struct SequenceSizeCompletion;

impl CompletionPolicy for SequenceSizeCompletion {
    fn is_complete(&self, key: &CorrelationKey, members: &[Message]) -> Result<bool, AggregatorError> {
        let mut expected = None;
        for member in members {
            let Some(size) = member.headers().sequence_size() else {
                return Ok(false);
            };
            match expected {
                None => expected = Some(size),
                Some(declared) if declared != size => {
                    return Err(AggregatorError::InconsistentSequenceSize {
                        key: key.clone(),
                        expected: declared,
                        found: size,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(expected.is_some_and(|size| members.len() as u64 == size))
    }
}

impl<F> CompletionPolicy for F
where
    F: Fn(&[Message]) -> bool + Send + Sync + 'static,
{
    fn is_complete(&self, _key: &CorrelationKey, members: &[Message]) -> Result<bool, AggregatorError> {
        Ok(self(members))
    }
}

impl CompletionPolicy for SelectorChain<[Message]> {
    fn is_complete(&self, _key: &CorrelationKey, members: &[Message]) -> Result<bool, AggregatorError> {
        Ok(self.accept(members))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member(number: u64, size: u64) -> Message {
        Message::builder(json!(number))
            .correlation_id("k")
            .sequence(number, size)
            .build()
    }

    #[test]
    fn sequence_size_completes_on_exact_count() {
        let key = CorrelationKey::from("k");
        let policy = SequenceSizeCompletion;
        assert!(!policy.is_complete(&key, &[member(1, 2)]).unwrap());
        assert!(policy.is_complete(&key, &[member(1, 2), member(2, 2)]).unwrap());
    }

    #[test]
    fn missing_size_header_never_completes() {
        let key = CorrelationKey::from("k");
        let bare = Message::builder(json!(0)).correlation_id("k").build();
        assert!(!SequenceSizeCompletion.is_complete(&key, &[bare]).unwrap());
    }

    #[test]
    fn mixed_sizes_are_a_configuration_error() {
        let key = CorrelationKey::from("k");
        let err = SequenceSizeCompletion
            .is_complete(&key, &[member(1, 2), member(2, 3)])
            .unwrap_err();
        assert!(err.is_configuration(), "序列大小不一致应视为配置错误");
        assert!(matches!(
            err,
            AggregatorError::InconsistentSequenceSize {
                expected: 2,
                found: 3,
                ..
            }
        ));
    }

    #[test]
    fn selector_chain_acts_as_group_predicate() {
        let chain: SelectorChain<[Message]> = SelectorChain::default();
        chain.add(|members: &[Message]| members.len() >= 2);
        let key = CorrelationKey::from("k");
        assert!(!chain.is_complete(&key, &[member(1, 0)]).unwrap());
        assert!(chain.is_complete(&key, &[member(1, 0), member(2, 0)]).unwrap());
    }
}
