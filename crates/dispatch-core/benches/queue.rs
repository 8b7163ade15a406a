//! Task queue throughput
//!
//! Run with: cargo bench -p dispatch-core

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use dispatch_core::queue::{Dequeued, TaskQueue};
use std::sync::Arc;
use std::thread;

const BATCH: u64 = 1024;

fn single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue/single");
    group.throughput(Throughput::Elements(BATCH));
    group.bench_function("enqueue_dequeue", |b| {
        let q = TaskQueue::new();
        b.iter(|| {
            for i in 0..BATCH {
                let _ = q.enqueue(black_box(i));
            }
            for _ in 0..BATCH {
                black_box(q.try_dequeue());
            }
        });
    });
    group.finish();
}

fn handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue/handoff");
    group.throughput(Throughput::Elements(BATCH));
    for consumers in [1usize, 4] {
        group.bench_function(format!("{}_consumers", consumers), |b| {
            b.iter(|| {
                let q: Arc<TaskQueue<u64>> = Arc::new(TaskQueue::new());
                let handles: Vec<_> = (0..consumers)
                    .map(|_| {
                        let q = q.clone();
                        thread::spawn(move || {
                            let mut n = 0u64;
                            while let Dequeued::Task(t) = q.dequeue_blocking() {
                                n += black_box(t) & 1;
                            }
                            n
                        })
                    })
                    .collect();
                for i in 0..BATCH {
                    let _ = q.enqueue(i);
                }
                while !q.is_empty() {
                    thread::yield_now();
                }
                q.begin_shutdown();
                for h in handles {
                    let _ = h.join();
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, single_thread, handoff);
criterion_main!(benches);
