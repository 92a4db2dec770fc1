//! Benchmarks for batch partitioning and gradient reduction

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use coordinator::{partition_batch, reduce_gradients};

fn bench_partition(c: &mut Criterion) {
    let workers: Vec<String> = (0..8).map(|i| format!("worker-{}", i)).collect();

    let mut group = c.benchmark_group("partition_batch");
    for batch_size in [64usize, 1024, 16384] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.iter(|| partition_batch(&workers, batch_size));
            },
        );
    }
    group.finish();
}

fn bench_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce_gradients");

    for (workers, len) in [(2usize, 100_000usize), (8, 100_000), (8, 1_000_000)] {
        let gradients: Vec<Vec<f32>> = (0..workers)
            .map(|w| (0..len).map(|i| (w * len + i) as f32 * 1e-6).collect())
            .collect();

        group.throughput(Throughput::Elements((workers * len) as u64));
        group.bench_with_input(
            BenchmarkId::new("sum_then_average", format!("{}w_{}", workers, len)),
            &gradients,
            |b, gradients| {
                b.iter(|| reduce_gradients(gradients).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_partition, bench_reduce);
criterion_main!(benches);
