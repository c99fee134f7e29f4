use std::sync::Arc;

use async_trait::async_trait;
use common::{CorrelationId, OrderId, ProductId, ReservationId};
use criterion::{Criterion, criterion_group, criterion_main};
use messaging::{
    Domain, EventChannel, EventEnvelope, HandlerError, InMemoryBroker, MessageHandler,
    StockReserved, Topology, routing::matches,
};

struct Noop;

#[async_trait]
impl MessageHandler for Noop {
    async fn handle(&self, _body: &[u8]) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn stock_reserved() -> EventEnvelope {
    let event = StockReserved {
        product_id: ProductId::new(1),
        quantity: 2,
        order_id: OrderId::new(),
        reservation_id: ReservationId::new(),
    };
    EventEnvelope::wrap(CorrelationId::new(), &event).unwrap()
}

fn bench_pattern_matching(c: &mut Criterion) {
    c.bench_function("routing/match_star", |b| {
        b.iter(|| matches("product.stock.*", "product.stock.reserved"));
    });

    c.bench_function("routing/match_hash", |b| {
        b.iter(|| matches("#.reserved", "product.stock.reserved"));
    });
}

fn bench_envelope_codec(c: &mut Criterion) {
    let envelope = stock_reserved();
    let bytes = envelope.to_bytes().unwrap();

    c.bench_function("envelope/encode", |b| {
        b.iter(|| envelope.to_bytes().unwrap());
    });

    c.bench_function("envelope/decode", |b| {
        b.iter(|| EventEnvelope::from_bytes(&bytes).unwrap());
    });
}

fn bench_publish_and_drain_100(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let envelope = stock_reserved();

    c.bench_function("broker/publish_and_drain_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let broker = InMemoryBroker::new(Topology::checkout());
                broker
                    .subscribe(Domain::Orders.queue(), Arc::new(Noop))
                    .await
                    .unwrap();
                for _ in 0..100 {
                    broker
                        .publish(
                            Domain::Products.topic(),
                            "product.stock.reserved",
                            &envelope,
                        )
                        .await
                        .unwrap();
                }
                broker.drain().await;
            });
        });
    });
}

criterion_group!(
    benches,
    bench_pattern_matching,
    bench_envelope_codec,
    bench_publish_and_drain_100
);
criterion_main!(benches);
