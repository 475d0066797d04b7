use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use pixelrelay::config::ConsumerConfig;
use pixelrelay::prelude::*;

struct InstantProcessor;

#[async_trait]
impl ProcessingClient for InstantProcessor {
    async fn call(&self, _endpoint: &str, arguments: Value) -> Result<StageResult> {
        let url = &arguments["image_url"];
        StageResult::from_body(
            json!({"image": {"url": url}, "images": [{"url": url}]}),
            Vec::new(),
        )
    }
}

fn consumer(broker: &MemoryBroker, limit: usize) -> PipelineConsumer {
    let pool = OffloadPool::new(10);
    let subscription = broker.subscribe("bench", &Topic::names());
    let publisher = AsyncPublisher::new(
        Arc::new(broker.clone()),
        pool.clone(),
        Duration::from_secs(1),
    );
    let handler = StageHandler::new(
        StageModels::default(),
        Arc::new(InstantProcessor),
        publisher,
        TopicGates::new(limit),
    );
    PipelineConsumer::from_parts(
        subscription,
        SharedResources::from_parts(HttpSession::new().unwrap(), pool),
        handler,
        &ConsumerConfig::default(),
    )
}

fn batch(size: usize) -> Vec<Message> {
    (0..size)
        .map(|i| {
            let topic = Topic::ALL[i % Topic::ALL.len()];
            Message::json(topic.as_str(), &format!("https://x/{}.png", i)).unwrap()
        })
        .collect()
}

fn bench_process_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_batch");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    for size in [10, 100, 500].iter() {
        group.throughput(Throughput::Elements(*size as u64));

        for limit in [1, 5, 50] {
            group.bench_with_input(
                BenchmarkId::new(format!("limit_{}", limit), size),
                size,
                |b, &size| {
                    b.iter(|| {
                        runtime.block_on(async {
                            let broker = MemoryBroker::new();
                            let consumer = consumer(&broker, limit);
                            black_box(consumer.process_batch(batch(size)).await)
                        })
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    group.bench_function("strict", |b| {
        let broker = MemoryBroker::new();
        let publisher = AsyncPublisher::new(
            Arc::new(broker.clone()),
            OffloadPool::new(4),
            Duration::from_secs(1),
        );
        b.iter(|| {
            runtime.block_on(async {
                publisher
                    .publish(Topic::Upscale, black_box("https://x/a.png"))
                    .await
                    .unwrap()
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_process_batch, bench_publish);
criterion_main!(benches);
