use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use subweld::prelude::*;

fn bench_queue_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_fanout");

    for subscribers in [1, 4, 16].iter() {
        group.throughput(Throughput::Elements(1000 * *subscribers as u64));

        group.bench_with_input(
            BenchmarkId::new("broadcast_then_drain", subscribers),
            subscribers,
            |b, &subscribers| {
                b.iter(|| {
                    tokio::runtime::Runtime::new().unwrap().block_on(async {
                        let producer = Producer::<u64>::default();
                        let subscriptions: Vec<_> =
                            (0..subscribers).map(|_| producer.subscribe()).collect();

                        for i in 0..1000 {
                            producer.broadcast(black_box(i));
                        }
                        for subscription in &subscriptions {
                            for _ in 0..1000 {
                                black_box(subscription.get().await.unwrap());
                            }
                        }
                    })
                });
            },
        );
    }

    group.finish();
}

fn bench_callback_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("callback_fanout");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("sync_callbacks", |b| {
        let producer = Producer::<u64>::default();
        for _ in 0..8 {
            producer.subscribe_with(Subscriber::callback(|n: u64| {
                black_box(n);
            }));
        }
        b.iter(|| {
            for i in 0..1000 {
                producer.broadcast(black_box(i));
            }
        });
    });

    group.finish();
}

fn bench_consumer_switching(c: &mut Criterion) {
    let mut group = c.benchmark_group("consumer_switching");

    group.bench_function("swap_and_read", |b| {
        b.iter(|| {
            tokio::runtime::Runtime::new().unwrap().block_on(async {
                let consumer = Consumer::<u64>::default();
                let producer = Producer::<u64>::default();
                for i in 0..100 {
                    consumer.put_subscription(producer.subscribe());
                    producer.broadcast(i);
                    black_box(consumer.next().await.unwrap());
                }
            })
        });
    });

    group.bench_function("direct_feed", |b| {
        b.iter(|| {
            tokio::runtime::Runtime::new().unwrap().block_on(async {
                let consumer = Consumer::<u64>::default();
                for i in 0..1000 {
                    consumer.put_nowait(black_box(i)).unwrap();
                    black_box(consumer.next().await.unwrap());
                }
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_queue_fanout,
    bench_callback_fanout,
    bench_consumer_switching
);
criterion_main!(benches);
