use std::sync::Arc;

use common::{CorrelationId, OrderId, ProductId, ReservationId};
use criterion::{Criterion, criterion_group, criterion_main};
use inventory::{
    InMemoryInventoryStore, InventoryLedger, InventoryStore, ReservationRequest,
};
use messaging::{EventPublisher, InMemoryBroker, Topology};

fn request(product: i64) -> ReservationRequest {
    ReservationRequest {
        reservation_id: ReservationId::new(),
        product_id: ProductId::new(product),
        quantity: 1,
        order_id: OrderId::new(),
        correlation_id: CorrelationId::new(),
    }
}

fn bench_reserve_single(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("ledger/reserve_single", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryInventoryStore::new();
                store.set_stock(ProductId::new(1), 10).await.unwrap();
                let ledger = InventoryLedger::new(
                    Arc::new(store),
                    EventPublisher::new(Arc::new(InMemoryBroker::new(Topology::checkout()))),
                );
                ledger.reserve(request(1)).await.unwrap();
            });
        });
    });
}

fn bench_reserve_100_against_busy_product(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("ledger/reserve_100_same_product", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryInventoryStore::new();
                store.set_stock(ProductId::new(1), 1_000).await.unwrap();
                let ledger = InventoryLedger::new(
                    Arc::new(store),
                    EventPublisher::new(Arc::new(InMemoryBroker::new(Topology::checkout()))),
                );
                for _ in 0..100 {
                    ledger.reserve(request(1)).await.unwrap();
                }
            });
        });
    });
}

criterion_group!(
    benches,
    bench_reserve_single,
    bench_reserve_100_against_busy_product
);
criterion_main!(benches);
