//! 属性测试：到达顺序无关的完整性判定与选择器投票算术。

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;
use spark_aggregator::{
    AggregatorBuilder, AggregatorConfig, HandleOutcome, MemberOrder, Message, QueueChannel,
    SelectorChain, VotingStrategy,
};

fn arrival_orders() -> impl Strategy<Value = Vec<u64>> {
    (1u64..=8).prop_flat_map(|size| Just((1..=size).collect::<Vec<_>>()).prop_shuffle())
}

fn reference_decision(strategy: VotingStrategy, votes: &[bool]) -> bool {
    let accepted = votes.iter().filter(|vote| **vote).count();
    let total = votes.len();
    match strategy {
        VotingStrategy::All => accepted == total,
        VotingStrategy::Any => accepted > 0,
        VotingStrategy::MoreThanHalf => accepted > 0 && accepted * 2 > total,
        VotingStrategy::AtLeastHalf => accepted > 0 && accepted * 2 >= total,
    }
}

const STRATEGIES: [VotingStrategy; 4] = [
    VotingStrategy::All,
    VotingStrategy::Any,
    VotingStrategy::MoreThanHalf,
    VotingStrategy::AtLeastHalf,
];

proptest! {
    #[test]
    fn prop_group_completes_exactly_on_last_member(order in arrival_orders()) {
        let size = order.len() as u64;
        let output = Arc::new(QueueChannel::new("output"));
        let config = AggregatorConfig::default().with_member_order(MemberOrder::SequenceNumber);
        let aggregator = AggregatorBuilder::new(config)
            .output_channel(output.clone())
            .build()
            .expect("配置合法");

        for (index, number) in order.iter().enumerate() {
            let message = Message::builder(json!(number))
                .correlation_id("perm")
                .sequence(*number, size)
                .build();
            let outcome = aggregator.handle(message).expect("不应失败");
            if index + 1 == order.len() {
                prop_assert_eq!(outcome, HandleOutcome::Released { outputs: 1 });
            } else {
                prop_assert_eq!(outcome, HandleOutcome::Buffered { group_size: index + 1 });
            }
        }

        let emitted = output.drain();
        prop_assert_eq!(emitted.len(), 1);
        let expected: Vec<_> = (1..=size).map(|number| json!(number)).collect();
        prop_assert_eq!(emitted[0].payload(), &json!(expected));
    }

    #[test]
    fn prop_chain_matches_reference_vote(votes in prop::collection::vec(any::<bool>(), 0..12)) {
        let chain: SelectorChain<u32> = SelectorChain::default();
        for vote in &votes {
            let vote = *vote;
            chain.add(move |_: &u32| vote);
        }
        let tally = chain.vote(&0);
        prop_assert_eq!(tally.total, votes.len());
        prop_assert_eq!(tally.accepted + tally.rejected(), votes.len());

        for strategy in STRATEGIES {
            chain.set_strategy(strategy);
            let expected = reference_decision(strategy, &votes);
            prop_assert_eq!(chain.accept(&0), expected, "strategy {}", strategy);
            prop_assert_eq!(tally.decide(strategy), expected, "strategy {}", strategy);
        }
    }
}
