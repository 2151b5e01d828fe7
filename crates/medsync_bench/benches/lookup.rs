//! Lookup-table materialization benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use medsync_bench::utils::{touch_random_encounters, unbuilt_central};

/// Benchmark the first build of the lookup table.
fn bench_initial_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_initial_build");
    group.sample_size(20);

    for patients in [100, 500, 2000].iter() {
        let rows = (*patients * 4) as u64;
        group.throughput(Throughput::Elements(rows));
        group.bench_with_input(BenchmarkId::from_parameter(patients), patients, |b, &patients| {
            b.iter_with_setup(
                || unbuilt_central(patients, 2),
                |central| {
                    central.update_lookup_table(false).unwrap();
                },
            );
        });
    }
    group.finish();
}

/// Benchmark incremental passes over a built table.
fn bench_incremental(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_incremental");

    for changed in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*changed as u64));
        group.bench_with_input(BenchmarkId::from_parameter(changed), changed, |b, &changed| {
            let central = unbuilt_central(1000, 4);
            central.update_lookup_table(false).unwrap();

            b.iter_with_setup(
                || touch_random_encounters(&central, 1000, 4, changed),
                |()| {
                    central.update_lookup_table(false).unwrap();
                },
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_initial_build, bench_incremental);
criterion_main!(benches);
