// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(
    missing_docs,
    clippy::unwrap_used,
    reason = "Benchmarks don't require documentation and should fail fast on errors"
)]

use criterion::{Criterion, criterion_group, criterion_main};
use taskwell::{Dispatch, DispatchExt, ImmediateDispatcher, PriorityDispatcher, SerialDispatcher};

fn entry(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    group.bench_function("immediate", |b| {
        let dispatcher = ImmediateDispatcher::new();
        b.iter(|| dispatcher.dispatch(|| 42, 0));
    });

    group.bench_function("priority_dispatch_invoke", |b| {
        let dispatcher = PriorityDispatcher::new();
        b.iter(|| {
            let task = dispatcher.dispatch(|| 42, fastrand::i32(0..64));
            dispatcher.invoke();
            assert_eq!(*task.get(), 42);
        });
    });

    group.bench_function("serial_over_immediate", |b| {
        let serial = SerialDispatcher::new(std::sync::Arc::new(ImmediateDispatcher::new()) as std::sync::Arc<dyn Dispatch>);
        b.iter(|| {
            let task = serial.dispatch(|| 42, 0);
            assert_eq!(*task.get(), 42);
        });
    });

    group.bench_function("continuation_chain", |b| {
        let dispatcher = ImmediateDispatcher::new();
        b.iter(|| {
            let task = dispatcher.dispatch(|| 0_u64, 0);
            let end = task.then(|v| v + 1, 0).then(|v| v + 1, 0).then(|v| v + 1, 0);
            assert_eq!(*end.get(), 3);
        });
    });

    group.finish();
}

criterion_group!(benches, entry);
criterion_main!(benches);
