use criterion::{black_box, criterion_group, criterion_main, Criterion};
use installkit_engine::{compute_ratios, Fraction, ProgressAggregator};

fn ratio_computation_benchmark(c: &mut Criterion) {
    let estimates: Vec<u32> = (1..=64).collect();

    c.bench_function("compute ratios 64 checkpoints", |b| {
        b.iter(|| compute_ratios(black_box(&estimates)));
    });
}

fn aggregation_benchmark(c: &mut Criterion) {
    let estimates: Vec<u32> = (1..=64).collect();
    let ratios = compute_ratios(&estimates);

    c.bench_function("aggregate full session", |b| {
        b.iter(|| {
            let mut aggregator = ProgressAggregator::new();
            for ratio in &ratios {
                aggregator.complete(black_box(*ratio));
            }
            assert_eq!(aggregator.completed(), Fraction::ONE);
        });
    });
}

fn scale_percent_benchmark(c: &mut Criterion) {
    let ratio = Fraction::ratio(1, 3);

    c.bench_function("scale checkpoint percent", |b| {
        b.iter(|| {
            for percent in 0..=100u8 {
                black_box(ratio.scale_percent(black_box(percent)));
            }
        });
    });
}

criterion_group!(
    benches,
    ratio_computation_benchmark,
    aggregation_benchmark,
    scale_percent_benchmark
);
criterion_main!(benches);
