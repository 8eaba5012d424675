use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::thread;

use serde_json::Value as JsonValue;
use stockflow_core::{LocationCode, ModelCode, SystemClock, UserId, WarehouseCode};
use stockflow_events::{EventEnvelope, InMemoryEventBus};
use stockflow_infra::{
    EngineConfig, InMemoryDocumentRepository, InMemoryOnhandLedger, InventoryEngine, OnhandLedger,
};
use stockflow_inventory::{
    DocEvent, DocType, DocumentHeader, LedgerDelta, LedgerPosting, LineInput, OnhandKey,
    TrackingType,
};

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
type Engine = InventoryEngine<InMemoryDocumentRepository, InMemoryOnhandLedger, Bus>;

fn key(model: usize) -> OnhandKey {
    OnhandKey::new(
        WarehouseCode::parse("W1").unwrap(),
        LocationCode::parse("L1").unwrap(),
        ModelCode::parse(format!("M{model}")).unwrap(),
    )
}

fn engine() -> Engine {
    InventoryEngine::new(
        InMemoryDocumentRepository::new(),
        InMemoryOnhandLedger::default(),
        Arc::new(InMemoryEventBus::new()),
        Arc::new(SystemClock),
        EngineConfig::default(),
    )
}

/// Single-threaded cost of one posting, with and without a batch.
fn bench_posting_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("posting_latency");

    group.bench_function("single_key_receipt", |b| {
        let ledger = InMemoryOnhandLedger::default();
        let posting = LedgerPosting {
            key: key(0),
            delta: LedgerDelta::quantity(1, 0),
        };
        b.iter(|| ledger.post_batch(black_box(std::slice::from_ref(&posting))).unwrap());
    });

    for batch_size in [4usize, 16, 64].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        let id = BenchmarkId::new("multi_key_batch", batch_size);
        group.bench_with_input(id, batch_size, |b, &size| {
            let ledger = InMemoryOnhandLedger::default();
            let postings: Vec<LedgerPosting> = (0..size)
                .map(|m| LedgerPosting {
                    key: key(m),
                    delta: LedgerDelta::quantity(1, 0),
                })
                .collect();
            b.iter(|| ledger.post_batch(black_box(&postings)).unwrap());
        });
    }

    group.finish();
}

/// Threads posting to disjoint keys should scale; threads on one key serialize.
fn bench_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("contention");
    let threads = 4usize;
    let per_thread = 250usize;
    group.throughput(Throughput::Elements((threads * per_thread) as u64));

    for (name, disjoint) in [("disjoint_keys", true), ("same_key", false)] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let ledger = Arc::new(InMemoryOnhandLedger::default());
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        let ledger = Arc::clone(&ledger);
                        let posting = LedgerPosting {
                            key: key(if disjoint { t } else { 0 }),
                            delta: LedgerDelta::quantity(1, 0),
                        };
                        thread::spawn(move || {
                            for _ in 0..per_thread {
                                ledger.post_batch(std::slice::from_ref(&posting)).unwrap();
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

/// Full receipt lifecycle through the engine: validation, posting, store, audit.
fn bench_receipt_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("document_lifecycle");
    let engine = engine();
    let header = DocumentHeader::new(
        WarehouseCode::parse("W1").unwrap(),
        LocationCode::parse("L1").unwrap(),
    );
    let user = UserId::new();

    group.bench_function("goods_receipt_create_to_confirm", |b| {
        b.iter(|| {
            let m1 = ModelCode::parse("M1").unwrap();
            let lines = vec![LineInput::new(m1, "EA", TrackingType::None, 5)];
            let gr = engine
                .create_document(DocType::GoodsReceipt, header.clone(), lines, user)
                .unwrap();
            for event in [DocEvent::StartReceiving, DocEvent::Submit, DocEvent::Confirm] {
                engine.transition(gr.doc_id(), event, user, None).unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_posting_latency, bench_contention, bench_receipt_lifecycle);
criterion_main!(benches);
