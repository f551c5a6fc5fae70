//! 端到端聚合路径：完整释放、驱逐、迟到、重复、准入与投递失败。

use std::sync::Arc;

use serde_json::json;
use spark_aggregator::{
    Aggregator, AggregatorBuilder, AggregatorConfig, AggregatorError, CorrelationKey, HandleOutcome,
    HeaderSelector, MemberOrder, Message, MessageBuilder, QueueChannel, ReplyBuilder, SelectorChain,
    VotingStrategy, headers,
};

fn member(key: &str, number: u64, size: u64) -> Message {
    Message::builder(json!(format!("{key}-{number}")))
        .correlation_id(key)
        .sequence(number, size)
        .build()
}

struct Fixture {
    aggregator: Aggregator,
    output: Arc<QueueChannel>,
    discard: Arc<QueueChannel>,
}

fn fixture(config: AggregatorConfig) -> Fixture {
    let output = Arc::new(QueueChannel::new("output"));
    let discard = Arc::new(QueueChannel::new("discard"));
    let aggregator = AggregatorBuilder::new(config)
        .output_channel(output.clone())
        .discard_channel(discard.clone())
        .build()
        .expect("配置合法");
    Fixture {
        aggregator,
        output,
        discard,
    }
}

#[test]
fn complete_group_emits_payload_list_once() {
    let fx = fixture(AggregatorConfig::default());

    assert_eq!(
        fx.aggregator.handle(member("order-1", 1, 3)).unwrap(),
        HandleOutcome::Buffered { group_size: 1 }
    );
    assert_eq!(
        fx.aggregator.handle(member("order-1", 2, 3)).unwrap(),
        HandleOutcome::Buffered { group_size: 2 }
    );
    assert_eq!(
        fx.aggregator.handle(member("order-1", 3, 3)).unwrap(),
        HandleOutcome::Released { outputs: 1 }
    );

    let emitted = fx.output.drain();
    assert_eq!(emitted.len(), 1, "完整分组只应产出一条消息");
    assert_eq!(
        emitted[0].payload(),
        &json!(["order-1-1", "order-1-2", "order-1-3"])
    );
    assert_eq!(emitted[0].header(headers::CORRELATION_ID), Some(&json!("order-1")));
    assert!(fx.aggregator.store().is_empty(), "释放后分组应离开仓储");
    assert!(fx.discard.is_empty());
    assert_eq!(fx.aggregator.metrics().groups_released_complete, 1);
}

#[test]
fn sequence_order_sorts_out_of_order_arrivals() {
    let fx = fixture(AggregatorConfig::default().with_member_order(MemberOrder::SequenceNumber));

    fx.aggregator.handle(member("k", 3, 3)).unwrap();
    fx.aggregator.handle(member("k", 1, 3)).unwrap();
    fx.aggregator.handle(member("k", 2, 3)).unwrap();

    let emitted = fx.output.receive().expect("应有输出");
    assert_eq!(emitted.payload(), &json!(["k-1", "k-2", "k-3"]));
}

#[test]
fn missing_correlation_key_is_an_error() {
    let fx = fixture(AggregatorConfig::default());
    let message = Message::builder(json!("orphan")).sequence(1, 1).build();

    let err = fx.aggregator.handle(message).unwrap_err();
    assert!(matches!(
        err,
        AggregatorError::MissingCorrelationKey { ref header, .. } if header == headers::CORRELATION_ID
    ));
    assert_eq!(err.code(), "aggregator.correlation.missing");
    assert!(fx.aggregator.store().is_empty());
}

#[test]
fn custom_correlation_header_is_honoured() {
    let config = AggregatorConfig::default().with_correlation_header("batch");
    let fx = fixture(config);
    let message = Message::builder(json!(1))
        .header("batch", 42)
        .sequence(1, 1)
        .build();

    assert_eq!(
        fx.aggregator.handle(message).unwrap(),
        HandleOutcome::Released { outputs: 1 }
    );
    let emitted = fx.output.receive().expect("应有输出");
    assert_eq!(emitted.header("batch"), Some(&json!(42)));
}

#[test]
fn oldest_group_is_evicted_at_capacity_and_key_can_return() {
    let fx = fixture(AggregatorConfig::default().with_capacity(2));

    fx.aggregator.handle(member("a", 1, 2)).unwrap();
    fx.aggregator.handle(member("b", 1, 2)).unwrap();
    fx.aggregator.handle(member("c", 1, 2)).unwrap();

    let store = fx.aggregator.store();
    assert_eq!(store.len(), 2);
    assert!(!store.contains(&CorrelationKey::from("a")), "最早的分组应被驱逐");
    assert!(!store.is_completed(&CorrelationKey::from("a")), "驱逐不算完成");

    let discarded = fx.discard.drain();
    assert_eq!(discarded.len(), 1);
    assert_eq!(discarded[0].payload(), &json!("a-1"));

    // 被驱逐的键重新出现时开启新分组，而不是被当作迟到消息
    assert_eq!(
        fx.aggregator.handle(member("a", 2, 2)).unwrap(),
        HandleOutcome::Buffered { group_size: 1 }
    );
    assert!(store.contains(&CorrelationKey::from("a")));
    assert!(!store.contains(&CorrelationKey::from("b")));

    let metrics = fx.aggregator.metrics();
    assert_eq!(metrics.groups_discarded_evicted, 2);
    assert_eq!(metrics.groups_created, 4);
    assert_eq!(metrics.messages_late, 0);
}

#[test]
fn message_for_completed_key_is_late() {
    let fx = fixture(AggregatorConfig::default());
    fx.aggregator.handle(member("k", 1, 1)).unwrap();

    let outcome = fx.aggregator.handle(member("k", 2, 2)).unwrap();
    assert_eq!(outcome, HandleOutcome::LateArrival);
    assert_eq!(fx.discard.len(), 1, "迟到消息应进入丢弃通道");
    assert!(fx.aggregator.store().is_empty(), "迟到消息不应重建分组");
    assert_eq!(fx.aggregator.metrics().messages_late, 1);
}

#[test]
fn late_detection_can_be_disabled() {
    let fx = fixture(AggregatorConfig::default().with_completed_key_capacity(0));
    fx.aggregator.handle(member("k", 1, 1)).unwrap();

    assert_eq!(
        fx.aggregator.handle(member("k", 1, 2)).unwrap(),
        HandleOutcome::Buffered { group_size: 1 }
    );
}

#[test]
fn duplicate_sequence_number_is_discarded() {
    let fx = fixture(AggregatorConfig::default());
    fx.aggregator.handle(member("k", 1, 2)).unwrap();

    assert_eq!(
        fx.aggregator.handle(member("k", 1, 2)).unwrap(),
        HandleOutcome::Duplicate
    );
    assert_eq!(fx.discard.len(), 1);
    assert_eq!(
        fx.aggregator.handle(member("k", 2, 2)).unwrap(),
        HandleOutcome::Released { outputs: 1 },
        "重复消息不计入完整性"
    );
}

#[test]
fn duplicates_are_kept_when_rejection_disabled() {
    let fx = fixture(AggregatorConfig::default().with_duplicate_rejection(false));
    fx.aggregator.handle(member("k", 1, 2)).unwrap();

    assert_eq!(
        fx.aggregator.handle(member("k", 1, 2)).unwrap(),
        HandleOutcome::Released { outputs: 1 }
    );
}

#[test]
fn inconsistent_sequence_size_leaves_group_untouched() {
    let fx = fixture(AggregatorConfig::default());
    fx.aggregator.handle(member("k", 1, 2)).unwrap();

    let err = fx.aggregator.handle(member("k", 2, 3)).unwrap_err();
    assert!(matches!(
        err,
        AggregatorError::InconsistentSequenceSize { expected: 2, found: 3, .. }
    ));
    let group = fx
        .aggregator
        .store()
        .get(&CorrelationKey::from("k"))
        .expect("分组仍在");
    assert_eq!(group.len(), 1, "判定失败的消息不应留在分组中");

    assert_eq!(
        fx.aggregator.handle(member("k", 2, 2)).unwrap(),
        HandleOutcome::Released { outputs: 1 }
    );
}

#[test]
fn rejected_message_goes_to_discard_channel() {
    let admission: SelectorChain<Message> = SelectorChain::new(VotingStrategy::All);
    admission.add(HeaderSelector::present("tenant"));
    let output = Arc::new(QueueChannel::new("output"));
    let discard = Arc::new(QueueChannel::new("discard"));
    let aggregator = Aggregator::builder()
        .admission(admission.clone())
        .output_channel(output.clone())
        .discard_channel(discard.clone())
        .build()
        .unwrap();

    assert_eq!(
        aggregator.handle(member("k", 1, 1)).unwrap(),
        HandleOutcome::Rejected
    );
    assert_eq!(discard.len(), 1);
    assert!(aggregator.store().is_empty(), "被拒绝的消息不创建分组");

    let tagged = Message::builder(json!(1))
        .correlation_id("k")
        .sequence(1, 1)
        .header("tenant", "acme")
        .build();
    assert_eq!(
        aggregator.handle(tagged).unwrap(),
        HandleOutcome::Released { outputs: 1 }
    );

    // 运行时放宽规则立即生效
    admission.set_strategy(VotingStrategy::Any);
    admission.add(|_: &Message| true);
    assert_eq!(
        aggregator.handle(member("other", 1, 1)).unwrap(),
        HandleOutcome::Released { outputs: 1 }
    );
    assert_eq!(aggregator.metrics().messages_rejected, 1);
}

#[test]
fn rejected_output_is_reported_and_group_is_not_reopened() {
    let output = Arc::new(QueueChannel::bounded("full", 0));
    let aggregator = Aggregator::builder()
        .output_channel(output.clone())
        .build()
        .unwrap();

    let err = aggregator.handle(member("k", 1, 1)).unwrap_err();
    assert!(matches!(err, AggregatorError::DeliveryRejected { ref channel, .. } if channel == "full"));
    assert!(err.is_delivery());
    assert_eq!(err.correlation_key(), Some(&CorrelationKey::from("k")));
    assert!(aggregator.store().is_empty());
    assert!(aggregator.store().is_completed(&CorrelationKey::from("k")));
    assert_eq!(aggregator.metrics().delivery_failures, 1);
}

#[test]
fn closed_output_surfaces_channel_error() {
    let output = Arc::new(QueueChannel::new("closed"));
    output.close();
    let aggregator = Aggregator::builder()
        .output_channel(output.clone())
        .build()
        .unwrap();

    let err = aggregator.handle(member("k", 1, 1)).unwrap_err();
    assert_eq!(err.code(), "aggregator.delivery.failed");
    assert!(std::error::Error::source(&err).is_some(), "应保留底层通道错误");
}

#[test]
fn discard_channel_is_last_resort_output() {
    let discard = Arc::new(QueueChannel::new("discard"));
    let aggregator = Aggregator::builder()
        .discard_channel(discard.clone())
        .build()
        .unwrap();

    aggregator.handle(member("k", 1, 1)).unwrap();
    assert_eq!(discard.len(), 1);
}

#[test]
fn no_output_anywhere_is_reported() {
    let aggregator = Aggregator::builder().build().unwrap();
    let err = aggregator.handle(member("k", 1, 1)).unwrap_err();
    assert!(matches!(err, AggregatorError::NoReplyChannel { .. }));
}

#[test]
fn invalid_config_is_rejected_at_build() {
    let config = AggregatorConfig::default().with_capacity(0);
    let err = AggregatorBuilder::new(config).build().unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn custom_completion_policy_and_processor() {
    let output = Arc::new(QueueChannel::new("sink"));
    let aggregator = Aggregator::builder()
        .completion_policy(|members: &[Message]| members.len() == 2)
        .processor(|key: &CorrelationKey, members: &[Message], reply: &mut ReplyBuilder| {
            reply.set(MessageBuilder::new(
                json!({ "key": key.as_str(), "count": members.len() }),
            ));
        })
        .output_channel(output.clone())
        .build()
        .unwrap();

    aggregator
        .handle(Message::builder(json!(1)).correlation_id("x").build())
        .unwrap();
    let outcome = aggregator
        .handle(Message::builder(json!(2)).correlation_id("x").build())
        .unwrap();
    assert_eq!(outcome, HandleOutcome::Released { outputs: 1 });
    let emitted = output.receive().expect("应有输出");
    assert_eq!(emitted.payload(), &json!({ "key": "x", "count": 2 }));
}
