//! Benchmarks for batch drain throughput
//!
//! This benchmark measures:
//! - Dispatch and completion overhead with an instant transport
//! - The effect of the concurrency limit on drain time
//! - Cost of draining a batch where most operations fail

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use upload_batch::batch::{Batch, PayloadRef};
use upload_batch::transport::{Script, SimulatedTransport};

const OPS: usize = 1_000;

fn payloads() -> impl Iterator<Item = PayloadRef> {
    let payload = PayloadRef::bytes(vec![0u8; 64]);
    (0..OPS).map(move |_| payload.clone())
}

fn bench_drain(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("batch_drain");
    group.throughput(Throughput::Elements(OPS as u64));

    for limit in [1usize, 8, 64] {
        group.bench_with_input(BenchmarkId::new("all_succeed", limit), &limit, |b, &limit| {
            b.to_async(&rt).iter(|| async move {
                let batch = Batch::spawn(Arc::new(SimulatedTransport::new()), payloads(), limit)
                    .unwrap();
                batch.wait().await.unwrap()
            })
        });
    }

    group.bench_function("mostly_failing", |b| {
        b.to_async(&rt).iter(|| async {
            let transport = SimulatedTransport::new()
                .with_default_script(Script::Fail("insufficient storage".to_string()));
            let batch = Batch::spawn(Arc::new(transport), payloads(), 16).unwrap();
            batch.wait().await.unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_drain);
criterion_main!(benches);
