//! Benchmarks for engine-lock hand-off and evaluation
//!
//! Measures:
//! - Uncontended lock/unlock
//! - Unlocker release/restore round trip
//! - Evaluation under lock with N threads competing

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use openworkers_isolate_host::{Context, Isolate, Locker, Unlocker};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;

/// Benchmark: lock and unlock with no other thread involved
fn bench_uncontended_lock(c: &mut Criterion) {
    let isolate = Isolate::new(true);

    c.bench_function("locker_uncontended", |b| {
        b.iter(|| {
            let mut locker = Locker::new(&isolate);
            locker.enter();
            black_box(locker.entered());
        });
    });
}

/// Benchmark: Unlocker inside a held Locker
fn bench_unlocker_round_trip(c: &mut Criterion) {
    let isolate = Isolate::new(true);
    let mut locker = Locker::new(&isolate);
    locker.enter();

    c.bench_function("unlocker_round_trip", |b| {
        b.iter(|| {
            let mut unlocker = Unlocker::new(&isolate);
            unlocker.enter().unwrap();
            unlocker.leave();
        });
    });
}

/// Benchmark: short script per lock acquisition, several threads competing
fn bench_contended_eval(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_eval");

    for num_threads in [1, 2, 4] {
        group.bench_with_input(
            BenchmarkId::new("threads", num_threads),
            &num_threads,
            |b, &num_threads| {
                let isolate = Arc::new(Isolate::new(true));
                let context = Context::new(&isolate, None, &[]).unwrap();
                context.eval("let n = 0;").unwrap();

                b.iter(|| {
                    let workers: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let isolate = Arc::clone(&isolate);
                            let context = context.clone();
                            thread::spawn(move || {
                                for _ in 0..10 {
                                    isolate.with_lock(|| black_box(context.eval("n += 1;").unwrap()));
                                }
                            })
                        })
                        .collect();

                    for worker in workers {
                        worker.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_uncontended_lock,
    bench_unlocker_round_trip,
    bench_contended_eval
);

criterion_main!(benches);
