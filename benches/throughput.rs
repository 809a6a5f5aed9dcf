use std::sync::Arc;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use fraud_replay_stream::engine::score_lines;
use fraud_replay_stream::generator::SeriesGenerator;
use fraud_replay_stream::model::LogisticRegression;
use fraud_replay_stream::sink::{ColorStrategy, MemoryChannel, Publisher};
use fraud_replay_stream::types::{Transaction, DEFAULT_FEATURES};

fn model() -> LogisticRegression {
    let coefficients = vec![0.002, 0.00002, 0.00001, -0.00002, -0.000001, 0.000001, 0.0, 0.0];
    LogisticRegression::new(DEFAULT_FEATURES.to_vec(), coefficients, -5.8, 0.5).unwrap()
}

fn lines(size: usize) -> Vec<String> {
    let mut generator = SeriesGenerator::new(1, 0.05);
    (0..size).map(|_| generator.next_row().0.to_line()).collect()
}

fn parse_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for size in [100, 500, 1000, 5000] {
        let input = lines(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| input.iter().filter_map(|l| Transaction::parse(l).ok()).count());
        });
    }
    group.finish();
}

fn score_throughput(c: &mut Criterion) {
    let model = model();
    let mut group = c.benchmark_group("score_batch");
    for size in [100, 500, 1000, 5000] {
        let input = lines(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| score_lines(0, Utc::now(), input, &model));
        });
    }
    group.finish();
}

fn end_to_end(c: &mut Criterion) {
    let model = model();
    let mut group = c.benchmark_group("score_and_publish");
    for size in [100, 500, 1000, 5000] {
        let input = lines(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| {
                let map = Arc::new(MemoryChannel::new("map"));
                let aggregate = Arc::new(MemoryChannel::new("aggregate"));
                let publisher = Publisher::new(map, aggregate, ColorStrategy::Entity);
                let batch = score_lines(0, Utc::now(), input, &model);
                publisher.publish(&batch)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, parse_throughput, score_throughput, end_to_end);
criterion_main!(benches);
