// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(
    missing_docs,
    clippy::unwrap_used,
    reason = "Benchmarks don't require documentation and should fail fast on errors"
)]

use criterion::{Criterion, criterion_group, criterion_main};
use priq::PriorityQueue;

fn entry(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_queue");

    group.bench_function("insert_pop", |b| {
        let queue = PriorityQueue::new();
        b.iter(|| {
            queue.insert(fastrand::i32(..), 0_u64);
            queue.pop().unwrap();
        });
    });

    group.bench_function("insert_remove_by_token", |b| {
        let queue = PriorityQueue::new();
        b.iter(|| {
            let token = queue.insert(fastrand::i32(..), 0_u64);
            queue.remove(&token);
        });
    });

    group.bench_function("change_priority_loaded", |b| {
        let queue = PriorityQueue::new();
        let tokens: Vec<_> = (0..1_000).map(|i| queue.insert(i, ())).collect();
        b.iter(|| {
            let token = &tokens[fastrand::usize(..tokens.len())];
            queue.change_priority(token, fastrand::i32(..));
        });
    });

    group.finish();
}

criterion_group!(benches, entry);
criterion_main!(benches);
