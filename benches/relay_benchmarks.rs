// ABOUTME: Benchmark suite for the relay hot path: pool churn and fan-out accounting
// ABOUTME: Measures acquire/release cycles, handle cloning, and payload views

use bytehub::FramePool;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::time::Duration;

fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_acquire_release");
    group.measurement_time(Duration::from_secs(5));

    for &frame_size in &[4 * 1024usize, 64 * 1024, 1024 * 1024] {
        let pool = FramePool::new(frame_size, 64);
        group.bench_with_input(
            BenchmarkId::from_parameter(frame_size),
            &pool,
            |b, pool| {
                b.iter(|| {
                    let frame = pool.try_acquire().expect("pool drained during bench");
                    black_box(&frame);
                    frame.adjust_uses(-1);
                });
            },
        );
    }
    group.finish();
}

fn bench_fan_out_accounting(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out_accounting");
    group.measurement_time(Duration::from_secs(5));

    // One +k, k handle clones, k+1 releases: the dispatcher's per-frame work
    // minus the socket writes.
    for &peers in &[1usize, 8, 64] {
        let pool = FramePool::new(4 * 1024, 8);
        group.bench_with_input(BenchmarkId::from_parameter(peers), &pool, |b, pool| {
            b.iter(|| {
                let frame = pool.try_acquire().expect("pool drained during bench");
                frame.adjust_uses(peers as isize);
                for _ in 0..peers {
                    let handle = frame.clone();
                    handle.adjust_uses(-1);
                }
                frame.adjust_uses(-1);
            });
        });
    }
    group.finish();
}

fn bench_fill_and_view(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill_and_view");

    let pool = FramePool::new(64 * 1024, 8);
    let payload = vec![0xA5u8; 64 * 1024];
    group.bench_function("fill_64k_and_read_payload", |b| {
        b.iter(|| {
            let mut frame = pool.try_acquire().expect("pool drained during bench");
            frame.data_mut().copy_from_slice(&payload);
            frame.set_filled(payload.len());
            black_box(frame.payload().len());
            frame.adjust_uses(-1);
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_fan_out_accounting,
    bench_fill_and_view
);
criterion_main!(benches);
