use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use genqueue_core::{ConversationId, ModelId, ProviderId};
use genqueue_scheduler::{InMemoryJobStore, JobStore};

/// Fill a fresh store with `n` queued jobs for one provider.
fn seeded_store(n: usize) -> (InMemoryJobStore, ProviderId) {
    let store = InMemoryJobStore::new();
    let provider = ProviderId::new("bench");
    let model = ModelId::new("bench-model");
    for i in 0..n {
        let job = store
            .create(
                ConversationId::new(),
                &provider,
                &model,
                serde_json::json!({ "i": i }),
                3,
            )
            .expect("create");
        store.enqueue(job.id).expect("enqueue");
    }
    (store, provider)
}

/// Drain the queue through `claim_next`, the contended hot path of the
/// dispatcher.
fn bench_claim_next(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_next");
    for &n in &[100usize, 1_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(
                || seeded_store(n),
                |(store, provider)| {
                    while let Some(job) = store.claim_next(&provider).expect("claim") {
                        black_box(job);
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_claim_next);
criterion_main!(benches);
