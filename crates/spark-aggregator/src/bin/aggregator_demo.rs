//! 聚合演示：多个生产者线程并发投递分片消息，后台回收任务处理缺片的订单。
//!
//! # 使用方法
//! ```bash
//! RUST_LOG=spark_aggregator=debug cargo run -p spark-aggregator --features demo \
//!     --bin aggregator_demo -- [aggregator.toml]
//! ```
//! - 可选参数为 [`AggregatorConfig`] 的 TOML 文件；缺省时使用演示用的短超时配置。
//! - 第 4 个生产者会故意跳过部分分片，这些订单只能由回收任务按超时处置。

use std::env;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use spark_aggregator::telemetry::install_fmt_subscriber;
use spark_aggregator::{
    AggregatorBuilder, AggregatorConfig, DrainPolicy, HandleOutcome, Message, QueueChannel, Reaper,
};

const PRODUCERS: u64 = 4;
const ORDERS: u64 = 50;

fn main() -> Result<()> {
    install_fmt_subscriber().context("安装日志订阅器失败")?;
    let config = load_config(env::args().nth(1))?;
    let settle_after = config.group_timeout() + config.reaper_interval() * 2;

    let output = Arc::new(QueueChannel::new("orders.aggregated"));
    let discard = Arc::new(QueueChannel::new("orders.discarded"));
    let aggregator = Arc::new(
        AggregatorBuilder::new(config)
            .output_channel(output.clone())
            .discard_channel(discard.clone())
            .build()
            .context("构建聚合器失败")?,
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("创建 Tokio 运行时失败")?;

    let report = runtime.block_on(async {
        let reaper = Reaper::new(Arc::clone(&aggregator)).spawn();

        let producers: Vec<_> = (1..=PRODUCERS)
            .map(|part| {
                let aggregator = Arc::clone(&aggregator);
                thread::spawn(move || produce(&aggregator, part))
            })
            .collect();
        while !producers.iter().all(thread::JoinHandle::is_finished) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for producer in producers {
            if producer.join().is_err() {
                eprintln!("生产者线程异常退出");
            }
        }

        // 等待缺片订单超时
        tokio::time::sleep(settle_after).await;
        reaper.shutdown().await
    });

    println!("drain policy: {:?}", report.policy);
    println!("aggregated messages: {}", output.len());
    println!("discarded messages: {}", discard.len());
    for (name, value) in aggregator.metrics().entries() {
        println!("{name}={value}");
    }
    Ok(())
}

fn load_config(path: Option<String>) -> Result<AggregatorConfig> {
    let Some(path) = path else {
        return Ok(AggregatorConfig::default()
            .with_group_timeout(Duration::from_millis(200))
            .with_reaper_interval(Duration::from_millis(50))
            .with_partial_result_on_timeout(true)
            .with_drain_policy(DrainPolicy::ReleasePartial));
    };
    let raw = fs::read_to_string(&path).with_context(|| format!("读取配置文件 {path} 失败"))?;
    AggregatorConfig::from_toml_str(&raw).with_context(|| format!("解析配置文件 {path} 失败"))
}

fn produce(aggregator: &spark_aggregator::Aggregator, part: u64) {
    for order in 0..ORDERS {
        if part == PRODUCERS && order % 10 == 0 {
            continue;
        }
        let message = Message::builder(json!({ "order": order, "part": part }))
            .correlation_id(format!("order-{order}"))
            .sequence(part, PRODUCERS)
            .build();
        match aggregator.handle(message) {
            Ok(HandleOutcome::Released { outputs }) => {
                tracing::debug!(order, outputs, "order aggregated");
            }
            Ok(_) => {}
            Err(err) => tracing::error!(order, code = err.code(), error = %err, "order rejected"),
        }
    }
}
