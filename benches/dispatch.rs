use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cadence::{Dispatcher, ThreadPool};

fn for_range(c: &mut Criterion) {
    let pool = ThreadPool::builder().build();
    let dispatcher = Dispatcher::new(&pool);

    let mut group = c.benchmark_group("for_range");
    for count in [1_000usize, 100_000] {
        group.bench_function(format!("parallel/{}", count), |b| {
            b.iter(|| {
                dispatcher.for_range(0..count, |i| {
                    black_box(i * 2);
                });
            });
        });
        group.bench_function(format!("sequential/{}", count), |b| {
            b.iter(|| {
                for i in 0..count {
                    black_box(i * 2);
                }
            });
        });
    }
    group.finish();

    pool.shut_down().wait();
}

fn sort(c: &mut Criterion) {
    let pool = ThreadPool::builder().build();
    let dispatcher = Dispatcher::new(&pool);

    let mut seed = 0x2545_F491_4F6C_DD1Du64;
    let values: Vec<u64> = (0..500_000)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        })
        .collect();

    let mut group = c.benchmark_group("sort");
    group.bench_function("parallel", |b| {
        b.iter(|| {
            let mut data = values.clone();
            dispatcher.sort(&mut data);
            black_box(data);
        });
    });
    group.bench_function("std_unstable", |b| {
        b.iter(|| {
            let mut data = values.clone();
            data.sort_unstable();
            black_box(data);
        });
    });
    group.finish();

    pool.shut_down().wait();
}

criterion_group!(benches, for_range, sort);
criterion_main!(benches);
