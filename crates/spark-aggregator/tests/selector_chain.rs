//! 选择器链：投票策略、运行时编辑与作为完整性策略的用法。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use serde_json::json;
use spark_aggregator::{
    AggregatorBuilder, AggregatorConfig, HandleOutcome, Message, MessageSelector, QueueChannel,
    SelectorChain, SelectorError, VotingStrategy,
};

fn constant(answer: bool) -> Arc<dyn MessageSelector<Message>> {
    Arc::new(move |_: &Message| answer)
}

#[test]
fn two_of_four_selectors_accepting() {
    let chain: SelectorChain = SelectorChain::default();
    chain
        .set_selectors([constant(true), constant(false), constant(true), constant(false)])
        .unwrap();
    let message = Message::new(json!("subject"));

    let expectations = [
        (VotingStrategy::All, false),
        (VotingStrategy::Any, true),
        (VotingStrategy::MoreThanHalf, false),
        (VotingStrategy::AtLeastHalf, true),
    ];
    for (strategy, expected) in expectations {
        chain.set_strategy(strategy);
        assert_eq!(chain.accept(&message), expected, "{strategy} 的结论不符");
    }

    let vote = chain.vote(&message);
    assert_eq!((vote.accepted, vote.rejected(), vote.total), (2, 2, 4));
}

#[test]
fn empty_chain_defaults() {
    let message = Message::new(json!(null));
    let chain: SelectorChain = SelectorChain::new(VotingStrategy::All);
    assert!(chain.accept(&message), "空链在 All 下接受");
    chain.set_strategy(VotingStrategy::Any);
    assert!(!chain.accept(&message), "空链在 Any 下拒绝");
}

#[test]
fn required_chain_refuses_empty_selector_set() {
    let err = SelectorChain::<Message>::requiring_selectors(VotingStrategy::Any, Vec::new()).unwrap_err();
    assert_eq!(err, SelectorError::EmptySelectorSet);

    let chain = SelectorChain::requiring_selectors(VotingStrategy::Any, vec![constant(true)]).unwrap();
    assert_eq!(
        chain.set_selectors(Vec::new()),
        Err(SelectorError::EmptySelectorSet)
    );
    assert_eq!(chain.len(), 1, "被拒绝的替换不得生效");
}

#[test]
fn all_strategy_short_circuits_in_order() {
    let evaluated = Arc::new(AtomicUsize::new(0));
    let counting = |answer: bool| {
        let evaluated = Arc::clone(&evaluated);
        move |_: &Message| {
            evaluated.fetch_add(1, Ordering::SeqCst);
            answer
        }
    };

    let chain: SelectorChain = SelectorChain::new(VotingStrategy::All);
    chain.add(counting(true));
    chain.add(counting(true));
    chain.add_at(0, counting(false)).unwrap();

    assert!(!chain.accept(&Message::new(json!(1))));
    assert_eq!(evaluated.load(Ordering::SeqCst), 1, "插在首位的拒绝者应第一个被求值");

    evaluated.store(0, Ordering::SeqCst);
    chain.vote(&Message::new(json!(1)));
    assert_eq!(evaluated.load(Ordering::SeqCst), 3, "完整计票不短路");
}

#[test]
fn strategy_can_be_set_by_name() {
    let chain: SelectorChain = SelectorChain::default();
    chain.set_strategy_name("at_least_half").unwrap();
    assert_eq!(chain.strategy(), VotingStrategy::AtLeastHalf);

    let err = chain.set_strategy_name("majority").unwrap_err();
    assert_eq!(err, SelectorError::UnknownStrategy("majority".to_owned()));
    assert_eq!(chain.strategy(), VotingStrategy::AtLeastHalf, "未知名称不改变策略");
}

#[test]
fn concurrent_edits_are_never_lost() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 50;

    let chain: SelectorChain = SelectorChain::new(VotingStrategy::Any);
    let barrier = Arc::new(Barrier::new(WRITERS + 1));

    let writers: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let chain = chain.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for index in 0..PER_WRITER {
                    if (writer + index) % 2 == 0 {
                        chain.add(|_: &Message| true);
                    } else {
                        chain.add_at(0, |_: &Message| false).expect("下标 0 总是合法");
                    }
                }
            })
        })
        .collect();

    let reader = {
        let chain = chain.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let message = Message::new(json!(null));
            for _ in 0..200 {
                let vote = chain.vote(&message);
                assert!(vote.accepted <= vote.total);
            }
        })
    };

    for writer in writers {
        writer.join().expect("写线程不应 panic");
    }
    reader.join().expect("读线程不应 panic");

    assert_eq!(chain.len(), WRITERS * PER_WRITER, "并发追加不应丢失");
    let vote = chain.vote(&Message::new(json!(null)));
    assert_eq!(vote.accepted, WRITERS * PER_WRITER / 2);
}

#[test]
fn chain_over_members_drives_completion() {
    let completion: SelectorChain<[Message]> = SelectorChain::new(VotingStrategy::Any);
    completion.add(|members: &[Message]| members.len() >= 3);
    completion.add(|members: &[Message]| {
        members
            .iter()
            .any(|member| member.header("last") == Some(&json!(true)))
    });

    let output = Arc::new(QueueChannel::new("output"));
    let aggregator = AggregatorBuilder::new(AggregatorConfig::default())
        .completion_policy(completion)
        .output_channel(output.clone())
        .build()
        .unwrap();

    let plain = || Message::builder(json!(1)).correlation_id("k").build();
    assert_eq!(
        aggregator.handle(plain()).unwrap(),
        HandleOutcome::Buffered { group_size: 1 }
    );
    let closing = Message::builder(json!(2))
        .correlation_id("k")
        .header("last", true)
        .build();
    assert_eq!(
        aggregator.handle(closing).unwrap(),
        HandleOutcome::Released { outputs: 1 }
    );
    assert_eq!(output.receive().map(|m| m.payload().clone()), Some(json!([1, 2])));
}
