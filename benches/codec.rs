use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

use relayq::{Accumulator, Codec, Label, V1Format, V2Format};

const SAMPLES: usize = 10_000;
const SERIES: usize = 10;

fn series_labels() -> Vec<Vec<Label>> {
    (0..SERIES)
        .map(|i| {
            vec![
                Label::new("__name__", "relay_bench_samples_total"),
                Label::new("instance", format!("node-{i:02}.cluster.local:9100")),
                Label::new("job", "metrics-relay"),
                Label::new("namespace", "monitoring"),
                Label::new("pod", format!("metrics-relay-{i:02}")),
                Label::new("region", "eu-west-1"),
            ]
        })
        .collect()
}

fn encode<C: Codec>(codec: C, series: &[Vec<Label>]) -> usize {
    let mut accumulator = Accumulator::new(codec);
    let base_ts = 1_700_000_000_000i64;
    for i in 0..SAMPLES {
        accumulator
            .add_sample(base_ts + i as i64, i as f64, &series[i % SERIES], None, None)
            .expect("add sample");
    }
    let mut encoded = 0usize;
    accumulator
        .marshal(&mut |_, buf| {
            encoded += buf.len();
            Ok(())
        })
        .expect("marshal");
    encoded
}

fn bench_encode(c: &mut Criterion) {
    let series = series_labels();
    let mut group = c.benchmark_group("encode_10k");

    group.bench_with_input(BenchmarkId::from_parameter("v1"), &series, |b, series| {
        b.iter_batched(
            V1Format::new,
            |codec| black_box(encode(codec, series)),
            BatchSize::LargeInput,
        );
    });
    group.bench_with_input(BenchmarkId::from_parameter("v2"), &series, |b, series| {
        b.iter_batched(
            V2Format::new,
            |codec| black_box(encode(codec, series)),
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_encode);
criterion_main!(benches);
