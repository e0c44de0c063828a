use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use serde_json::json;
use vayva_infra::config::ReliabilityConfig;
use vayva_infra::idempotency::{fingerprint, IdempotencyGuard, IdempotencyKey, StoredResponse};
use vayva_infra::jobs::BackoffSchedule;
use vayva_infra::store::InMemoryStore;
use vayva_infra::webhooks::{ShipmentReconciler, StatusUpdate};
use vayva_shipments::{translate, CanonicalStatus, Provider};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
}

fn order_payload(lines: usize) -> serde_json::Value {
    let items: Vec<_> = (0..lines)
        .map(|i| json!({ "sku": format!("SKU-{i}"), "qty": i % 5 + 1, "price": 1500 + i }))
        .collect();
    json!({ "order_ref": "ORD-1", "currency": "NGN", "items": items })
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    for lines in [1usize, 10, 100] {
        let payload = order_payload(lines);
        group.throughput(Throughput::Elements(lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &payload, |b, payload| {
            b.iter(|| fingerprint(black_box(payload)).expect("fingerprint"));
        });
    }
    group.finish();
}

fn bench_translate(c: &mut Criterion) {
    let mut group = c.benchmark_group("translate");
    for (provider, raw) in [
        (Provider::Kwik, "picked up"),
        (Provider::Courier, "Out-For-Delivery"),
        (Provider::Kwik, "TELEPORTED"),
    ] {
        group.bench_with_input(BenchmarkId::new(provider.as_str(), raw), &raw, |b, raw| {
            b.iter(|| translate(provider, black_box(raw)));
        });
    }
    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let schedule = BackoffSchedule::default();
    c.bench_function("backoff_calculate", |b| {
        let mut attempt = 0u32;
        b.iter(|| {
            attempt = attempt % 12 + 1;
            schedule.calculate(black_box(attempt))
        });
    });
}

fn bench_lock_key_cycle(c: &mut Criterion) {
    let rt = runtime();
    let guard = IdempotencyGuard::new(InMemoryStore::arc(), &ReliabilityConfig::default());
    let payload = order_payload(10);

    let mut group = c.benchmark_group("idempotency");
    group.sample_size(1000);
    let mut n = 0u64;
    group.bench_function("lock_complete_replay", |b| {
        b.iter(|| {
            n += 1;
            let key = IdempotencyKey::new("shipments.create", format!("key-{n}"));
            rt.block_on(async {
                guard.lock_key(&key, None, &payload).await.expect("lock");
                guard
                    .complete(&key, StoredResponse::new(201, b"{}".to_vec()))
                    .await
                    .expect("complete");
                guard.lock_key(&key, None, &payload).await.expect("replay")
            })
        });
    });
    group.finish();
}

fn bench_reconcile(c: &mut Criterion) {
    let rt = runtime();
    let reconciler = ShipmentReconciler::new(InMemoryStore::arc(), &ReliabilityConfig::default());

    c.bench_function("reconcile_forward_and_duplicate", |b| {
        b.iter(|| {
            rt.block_on(async {
                let shipment = reconciler
                    .create(None, "ORD-B", Provider::Kwik, None)
                    .await
                    .expect("create");
                for status in [
                    CanonicalStatus::Accepted,
                    CanonicalStatus::Accepted,
                    CanonicalStatus::InTransit,
                    CanonicalStatus::PickedUp,
                    CanonicalStatus::Delivered,
                ] {
                    reconciler
                        .apply(shipment.id, status, None, StatusUpdate::default())
                        .await
                        .expect("apply");
                }
            })
        });
    });
}

criterion_group!(
    benches,
    bench_fingerprint,
    bench_translate,
    bench_backoff,
    bench_lock_key_cycle,
    bench_reconcile
);
criterion_main!(benches);
