//! End-to-end checkout sagas across the cart, order and inventory domains on
//! the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use cart::{Cart, CartReactor, CartStatus, CartStore, CheckoutService, InMemoryCartStore};
use common::{CartId, CorrelationId, LineItem, Money, OrderId, ProductId, UserId};
use idempotency::{IdempotencyGuard, InMemoryIdempotencyStore};
use inventory::{
    InMemoryInventoryStore, InventoryLedger, InventoryReactor, InventoryStore, ReservationRequest,
    ReservationStatus,
};
use messaging::{
    CartCheckoutInitiated, Domain, EventChannel, EventEnvelope, EventPublisher, InMemoryBroker,
    MessageHandler, RetryPolicy, StockReleased, StockReserved, Topology,
};
use saga::{
    CompensationStatus, FailureKind, InMemorySagaStore, MirrorStatus, Order, OrderService,
    OrderStatus, SagaConfig, SagaError, SagaOrchestrator, SagaState, SagaStatus, SagaStore,
    SagaTimeoutSweeper,
};

const CART: i64 = 1;
const USER: i64 = 9;

struct System {
    broker: InMemoryBroker,
    publisher: EventPublisher,
    carts: InMemoryCartStore,
    checkout: CheckoutService,
    inventory: InMemoryInventoryStore,
    ledger: InventoryLedger,
    sagas: InMemorySagaStore,
    order_guard: InMemoryIdempotencyStore,
    orchestrator: Arc<SagaOrchestrator>,
    orders: OrderService,
    sweeper: SagaTimeoutSweeper,
}

impl System {
    async fn start(config: SagaConfig, reservation_ttl: Duration) -> Self {
        let broker = InMemoryBroker::new(Topology::checkout());
        let publisher = EventPublisher::new(Arc::new(broker.clone()));
        let retry = RetryPolicy::immediate(3);

        let carts = InMemoryCartStore::new();
        let checkout = CheckoutService::new(Arc::new(carts.clone()), publisher.clone());
        let cart_guard = IdempotencyGuard::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            Domain::Cart.service_name(),
        );
        broker
            .subscribe(
                Domain::Cart.queue(),
                Arc::new(CartReactor::new(Arc::new(carts.clone())).dispatcher(cart_guard, retry)),
            )
            .await
            .unwrap();

        let inventory = InMemoryInventoryStore::new();
        let ledger = InventoryLedger::new(Arc::new(inventory.clone()), publisher.clone())
            .with_reservation_ttl(reservation_ttl);
        let products_guard = IdempotencyGuard::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            Domain::Products.service_name(),
        );
        broker
            .subscribe(
                Domain::Products.queue(),
                Arc::new(InventoryReactor::new(ledger.clone()).dispatcher(products_guard, retry)),
            )
            .await
            .unwrap();

        let sagas = InMemorySagaStore::new();
        let order_guard = InMemoryIdempotencyStore::new();
        let orchestrator =
            SagaOrchestrator::new(Arc::new(sagas.clone()), publisher.clone(), config);
        let guard = IdempotencyGuard::new(
            Arc::new(order_guard.clone()),
            Domain::Orders.service_name(),
        );
        broker
            .subscribe(
                Domain::Orders.queue(),
                Arc::new(orchestrator.dispatcher(guard, retry)),
            )
            .await
            .unwrap();
        let orders = OrderService::new(Arc::new(sagas.clone()), publisher.clone());
        let sweeper = SagaTimeoutSweeper::new(orchestrator.clone(), Duration::from_secs(30));

        Self {
            broker,
            publisher,
            carts,
            checkout,
            inventory,
            ledger,
            sagas,
            order_guard,
            orchestrator,
            orders,
            sweeper,
        }
    }

    async fn with_defaults() -> Self {
        Self::start(SagaConfig::default(), Duration::from_secs(1800)).await
    }

    /// Stocks products and fills the cart with `(product, quantity, cents)`.
    async fn prepare(&self, stock: &[(i64, i64)], lines: &[(i64, u32, i64)]) {
        for &(product, total) in stock {
            self.inventory
                .set_stock(ProductId::new(product), total)
                .await
                .unwrap();
        }
        let items = lines
            .iter()
            .map(|&(product, quantity, cents)| {
                LineItem::new(ProductId::new(product), quantity, Money::from_cents(cents))
            })
            .collect();
        self.carts
            .save(&Cart::new(CartId::new(CART), UserId::new(USER), items))
            .await
            .unwrap();
    }

    async fn checkout(&self) -> CorrelationId {
        let correlation_id = self.checkout.checkout(CartId::new(CART)).await.unwrap();
        self.broker.drain().await;
        correlation_id
    }

    async fn saga(&self, correlation_id: CorrelationId) -> SagaState {
        self.sagas.get(correlation_id).await.unwrap().unwrap()
    }

    async fn order(&self, correlation_id: CorrelationId) -> Order {
        let order_id = self.saga(correlation_id).await.order_id.unwrap();
        self.orders.order(order_id).await.unwrap()
    }

    async fn cart_status(&self) -> CartStatus {
        self.carts
            .get(CartId::new(CART))
            .await
            .unwrap()
            .unwrap()
            .status
    }

    /// Reservations inventory still holds for the order.
    async fn held(&self, order_id: OrderId) -> usize {
        self.rows(order_id, ReservationStatus::Reserved).await
    }

    async fn rows(&self, order_id: OrderId, status: ReservationStatus) -> usize {
        self.inventory
            .for_order(order_id)
            .await
            .unwrap()
            .iter()
            .filter(|r| r.status == status)
            .count()
    }

    async fn total_stock(&self, product: i64) -> i64 {
        self.inventory
            .stock_level(ProductId::new(product))
            .await
            .unwrap()
            .unwrap()
            .total_stock
    }

    /// Asserts the order ended without holding or consuming any stock.
    async fn assert_stock_untouched(&self, order_id: OrderId) {
        assert_eq!(self.held(order_id).await, 0);
        assert_eq!(self.rows(order_id, ReservationStatus::Fulfilled).await, 0);
        assert_eq!(self.total_stock(1).await, 10);
        assert_eq!(self.total_stock(2).await, 10);
    }

    async fn deliver_all(&self, queue: &str) {
        while self.broker.deliver_next(queue).await.is_some() {}
    }
}

fn scenario_cart() -> [(i64, u32, i64); 2] {
    [(1, 2, 1000), (2, 1, 3000)]
}

#[tokio::test]
async fn test_checkout_places_then_completes_order() {
    let sys = System::with_defaults().await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;

    let correlation_id = sys.checkout().await;

    let saga = sys.saga(correlation_id).await;
    assert_eq!(saga.status, SagaStatus::OrderPlaced);
    assert_eq!(saga.payload.reserved.len(), 2);
    assert_eq!(saga.compensation_log, vec!["release_reservation"; 2]);

    let order = sys.order(correlation_id).await;
    assert_eq!(order.status, OrderStatus::Placed);
    assert_eq!(order.total, Money::from_cents(5000));
    assert_eq!(
        order.total,
        order.items.iter().map(|l| l.line_total()).sum::<Money>()
    );
    assert_eq!(sys.cart_status().await, CartStatus::CheckedOut);
    assert_eq!(sys.broker.published_of("OrderPlaced").await.len(), 1);

    let mirrors = sys.sagas.reservations(order.order_id).await.unwrap();
    assert_eq!(mirrors.len(), 2);
    assert!(mirrors.iter().all(|m| m.status == MirrorStatus::Reserved));

    sys.orders.confirm(order.order_id).await.unwrap();
    sys.broker.drain().await;

    let saga = sys.saga(correlation_id).await;
    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(sys.order(correlation_id).await.status, OrderStatus::Confirmed);

    let fulfilled = sys.inventory.for_order(order.order_id).await.unwrap();
    assert!(fulfilled.iter().all(|r| r.status == ReservationStatus::Fulfilled));
    let level = sys
        .inventory
        .stock_level(ProductId::new(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((level.total_stock, level.reserved), (8, 0));
}

#[tokio::test]
async fn test_order_id_is_minted_once_and_shared() {
    let sys = System::with_defaults().await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;

    let correlation_id = sys.checkout().await;
    let saga = sys.saga(correlation_id).await;
    let order_id = saga.order_id.unwrap();

    let created = sys.broker.published_of("OrderCreated").await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].correlation_id, correlation_id);
    assert_eq!(created[0].aggregate_id, order_id.to_string());

    for envelope in sys.broker.published_of("StockReserved").await {
        let event: StockReserved = envelope.decode().unwrap();
        assert_eq!(event.order_id, order_id);
        assert_eq!(envelope.correlation_id, correlation_id);
        assert!(saga.payload.expects(event.reservation_id));
    }
}

#[tokio::test]
async fn test_duplicate_stock_reserved_is_absorbed() {
    let sys = System::with_defaults().await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;
    let order_id = sys.saga(correlation_id).await.order_id.unwrap();

    let version = sys.saga(correlation_id).await.version;
    let processed = sys.order_guard.len().await;
    let reserved = sys.broker.published_of("StockReserved").await;

    sys.broker
        .redeliver(Domain::Orders.queue(), &reserved[0])
        .await
        .unwrap();
    sys.broker.drain().await;

    assert_eq!(sys.sagas.reservations(order_id).await.unwrap().len(), 2);
    assert_eq!(sys.sagas.compensations(order_id).await.unwrap().len(), 2);
    assert_eq!(sys.saga(correlation_id).await.version, version);
    assert_eq!(sys.order_guard.len().await, processed);
    assert!(sys.broker.dead_letters(Domain::Orders.queue()).await.is_empty());
}

#[tokio::test]
async fn test_duplicate_checkout_event_does_not_recreate_order() {
    let sys = System::with_defaults().await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;

    let published = sys.broker.published_of("CartCheckoutInitiated").await;
    let initiated: CartCheckoutInitiated = published[0].decode().unwrap();
    // Same correlation, fresh event id: passes the guard.
    sys.publisher
        .publish(correlation_id, &initiated)
        .await
        .unwrap();
    sys.broker.drain().await;

    assert_eq!(sys.sagas.saga_count().await, 1);
    assert_eq!(sys.broker.published_of("OrderCreated").await.len(), 1);
    assert_eq!(sys.saga(correlation_id).await.status, SagaStatus::OrderPlaced);
}

#[tokio::test]
async fn test_unpublished_order_created_is_republished_with_stored_ids() {
    let sys = System::with_defaults().await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = CorrelationId::new();
    let event = CartCheckoutInitiated {
        cart_id: CartId::new(CART),
        user_id: UserId::new(USER),
        total: Money::from_cents(5000),
        items: vec![LineItem::new(ProductId::new(1), 2, Money::from_cents(2500))],
    };

    // A saga stored in order_created whose OrderCreated never went out.
    let mut stalled = SagaState::new(
        correlation_id,
        event.cart_id,
        event.user_id,
        saga::SagaPayload {
            items: vec![messaging::OrderLine {
                product_id: ProductId::new(1),
                quantity: 2,
                unit_price: Money::from_cents(2500),
                reservation_id: common::ReservationId::new(),
            }],
            total: Money::from_cents(5000),
            ..Default::default()
        },
        chrono::Utc::now(),
        chrono::Duration::minutes(15),
    );
    let order_id = OrderId::new();
    stalled.order_id = Some(order_id);
    stalled.transition(SagaStatus::OrderCreated).unwrap();
    let order = Order::pending(
        order_id,
        correlation_id,
        event.user_id,
        event.cart_id,
        stalled.payload.items.clone(),
        stalled.payload.total,
        chrono::Utc::now(),
    );
    sys.sagas.create(&stalled, &order).await.unwrap();

    let tag = sys.orchestrator.start(correlation_id, event).await.unwrap();
    assert_eq!(tag, "checking_inventory");

    let created = sys.broker.published_of("OrderCreated").await;
    assert_eq!(created.len(), 1);
    let republished: messaging::OrderCreated = created[0].decode().unwrap();
    assert_eq!(republished.order_id, order_id);
    assert_eq!(republished.items, stalled.payload.items);
    assert_eq!(sys.sagas.saga_count().await, 1);
}

#[tokio::test]
async fn test_cancel_placed_order_compensates() {
    let sys = System::with_defaults().await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;
    let order_id = sys.saga(correlation_id).await.order_id.unwrap();

    sys.orders
        .cancel(order_id, Some("user_requested".into()))
        .await
        .unwrap();
    sys.broker.drain().await;

    let saga = sys.saga(correlation_id).await;
    assert_eq!(saga.status, SagaStatus::Cancelled);
    let failure = saga.payload.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.reason, "user_requested");
    assert_eq!(sys.order(correlation_id).await.status, OrderStatus::Cancelled);
    assert_eq!(sys.cart_status().await, CartStatus::Active);

    assert_eq!(sys.held(order_id).await, 0);
    let mirrors = sys.sagas.reservations(order_id).await.unwrap();
    assert!(mirrors.iter().all(|m| m.status == MirrorStatus::Released));
    let entries = sys.sagas.compensations(order_id).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.status == CompensationStatus::Completed));
}

#[tokio::test]
async fn test_cancel_rejects_terminal_order() {
    let sys = System::with_defaults().await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;
    let order_id = sys.saga(correlation_id).await.order_id.unwrap();

    sys.orders.cancel(order_id, None).await.unwrap();
    sys.broker.drain().await;

    assert!(matches!(
        sys.orders.cancel(order_id, None).await,
        Err(SagaError::OrderTerminal { .. })
    ));
    assert!(matches!(
        sys.orders.confirm(order_id).await,
        Err(SagaError::OrderNotPlaced { .. })
    ));
    assert!(matches!(
        sys.orders.cancel(OrderId::new(), None).await,
        Err(SagaError::OrderNotFound(_))
    ));
}

#[tokio::test]
async fn test_second_terminal_event_is_noop() {
    let sys = System::with_defaults().await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;
    let order_id = sys.saga(correlation_id).await.order_id.unwrap();

    sys.publisher
        .publish(
            correlation_id,
            &messaging::OrderFailed {
                order_id,
                reason: "payment_declined".into(),
            },
        )
        .await
        .unwrap();
    sys.publisher
        .publish(
            correlation_id,
            &messaging::OrderCancelled {
                order_id,
                reason: "user_requested".into(),
            },
        )
        .await
        .unwrap();
    sys.broker.drain().await;

    let saga = sys.saga(correlation_id).await;
    assert_eq!(saga.status, SagaStatus::Failed);
    assert_eq!(saga.payload.failure.unwrap().reason, "payment_declined");
    assert_eq!(sys.order(correlation_id).await.status, OrderStatus::Failed);
    assert_eq!(sys.held(order_id).await, 0);
}

#[tokio::test]
async fn test_refused_reservation_fails_saga_on_timeout() {
    let config = SagaConfig {
        saga_timeout: Duration::ZERO,
        ..SagaConfig::default()
    };
    let sys = System::start(config, Duration::from_secs(1800)).await;
    sys.prepare(&[(1, 3)], &[(1, 10, 1000)]).await;

    let correlation_id = sys.checkout().await;

    assert!(sys.broker.published_of("StockReserved").await.is_empty());
    assert_eq!(
        sys.saga(correlation_id).await.status,
        SagaStatus::CheckingInventory
    );

    let report = sys.sweeper.run_once().await.unwrap();
    assert_eq!(report.timed_out, 1);
    sys.broker.drain().await;

    let saga = sys.saga(correlation_id).await;
    assert_eq!(saga.status, SagaStatus::Failed);
    assert_eq!(saga.payload.failure.unwrap().reason, "reservation_timeout");
    assert_eq!(sys.order(correlation_id).await.status, OrderStatus::Failed);
    assert_eq!(sys.cart_status().await, CartStatus::Active);

    // Nothing left to time out.
    assert_eq!(sys.sweeper.run_once().await.unwrap().timed_out, 0);
}

#[tokio::test]
async fn test_partial_reservation_released_after_timeout() {
    let config = SagaConfig {
        saga_timeout: Duration::ZERO,
        ..SagaConfig::default()
    };
    let sys = System::start(config, Duration::from_secs(1800)).await;
    sys.prepare(&[(1, 10), (2, 0)], &scenario_cart()).await;

    let correlation_id = sys.checkout().await;
    let order_id = sys.saga(correlation_id).await.order_id.unwrap();
    assert_eq!(sys.held(order_id).await, 1);
    assert_eq!(sys.saga(correlation_id).await.payload.reserved.len(), 1);

    sys.sweeper.run_once().await.unwrap();
    sys.broker.drain().await;

    assert_eq!(sys.saga(correlation_id).await.status, SagaStatus::Failed);
    assert_eq!(sys.held(order_id).await, 0);
    let entries = sys.sagas.compensations(order_id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, CompensationStatus::Completed);
}

#[tokio::test]
async fn test_late_reservation_is_released_again() {
    let config = SagaConfig {
        saga_timeout: Duration::ZERO,
        ..SagaConfig::default()
    };
    let sys = System::start(config, Duration::from_secs(1800)).await;
    sys.prepare(&[(1, 0)], &[(1, 1, 1000)]).await;

    let correlation_id = sys.checkout().await;
    sys.sweeper.run_once().await.unwrap();
    sys.broker.drain().await;
    let saga = sys.saga(correlation_id).await;
    assert_eq!(saga.status, SagaStatus::Failed);
    let order_id = saga.order_id.unwrap();

    // Stock shows up and inventory reserves the line after the saga gave up.
    sys.inventory
        .set_stock(ProductId::new(1), 5)
        .await
        .unwrap();
    let line = &saga.payload.items[0];
    sys.ledger
        .reserve(ReservationRequest {
            reservation_id: line.reservation_id,
            product_id: line.product_id,
            quantity: line.quantity,
            order_id,
            correlation_id,
        })
        .await
        .unwrap();
    assert_eq!(sys.held(order_id).await, 1);
    sys.broker.drain().await;

    assert_eq!(sys.held(order_id).await, 0);
    assert_eq!(sys.broker.published_of("OrderFailed").await.len(), 2);
    let saga = sys.saga(correlation_id).await;
    assert_eq!(saga.status, SagaStatus::Failed);
    assert!(saga.expires_at > saga.created_at);
    let entries = sys.sagas.compensations(order_id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, CompensationStatus::Completed);
}

#[tokio::test]
async fn test_expired_hold_fails_placed_order() {
    let sys = System::start(SagaConfig::default(), Duration::ZERO).await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;
    assert_eq!(sys.saga(correlation_id).await.status, SagaStatus::OrderPlaced);

    assert_eq!(sys.ledger.expire_due(100).await.unwrap(), 2);
    sys.broker.drain().await;

    let saga = sys.saga(correlation_id).await;
    assert_eq!(saga.status, SagaStatus::Failed);
    assert_eq!(saga.payload.failure.unwrap().reason, "reservation_expired");
    assert_eq!(sys.cart_status().await, CartStatus::Active);
    assert_eq!(sys.held(saga.order_id.unwrap()).await, 0);
}

#[tokio::test]
async fn test_confirmation_racing_expired_hold_does_not_complete() {
    let sys = System::start(SagaConfig::default(), Duration::ZERO).await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;
    let order_id = sys.saga(correlation_id).await.order_id.unwrap();

    // Holds lapse in inventory while the order still looks placed.
    assert_eq!(sys.ledger.expire_due(100).await.unwrap(), 2);
    sys.orders.confirm(order_id).await.unwrap();
    sys.broker.drain().await;

    let saga = sys.saga(correlation_id).await;
    assert_eq!(saga.status, SagaStatus::Failed);
    assert_eq!(saga.payload.failure.unwrap().reason, "reservation_expired");
    assert_eq!(sys.order(correlation_id).await.status, OrderStatus::Failed);
    assert_eq!(sys.cart_status().await, CartStatus::Active);
    sys.assert_stock_untouched(order_id).await;
}

#[tokio::test]
async fn test_confirmation_reaching_inventory_first_fulfils_nothing_after_expiry() {
    let sys = System::start(SagaConfig::default(), Duration::ZERO).await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;
    let order_id = sys.saga(correlation_id).await.order_id.unwrap();

    sys.ledger.expire_due(100).await.unwrap();
    sys.orders.confirm(order_id).await.unwrap();
    sys.deliver_all(Domain::Products.queue()).await;
    assert_eq!(sys.rows(order_id, ReservationStatus::Fulfilled).await, 0);
    sys.broker.drain().await;

    assert_eq!(sys.saga(correlation_id).await.status, SagaStatus::Failed);
    sys.assert_stock_untouched(order_id).await;
}

#[tokio::test]
async fn test_confirm_is_rejected_while_compensating() {
    let sys = System::start(SagaConfig::default(), Duration::ZERO).await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;
    let order_id = sys.saga(correlation_id).await.order_id.unwrap();

    sys.ledger.expire_due(100).await.unwrap();
    // The orchestrator sees the first expiry; nothing else has run.
    sys.broker.deliver_next(Domain::Orders.queue()).await.unwrap();
    assert_eq!(
        sys.saga(correlation_id).await.status,
        SagaStatus::CompensationInProgress
    );
    assert_eq!(sys.order(correlation_id).await.status, OrderStatus::Placed);

    assert!(matches!(
        sys.orders.confirm(order_id).await,
        Err(SagaError::CompensationPending(_))
    ));
    assert!(sys.broker.published_of("OrderConfirmed").await.is_empty());

    sys.broker.drain().await;
    assert_eq!(sys.saga(correlation_id).await.status, SagaStatus::Failed);
    sys.assert_stock_untouched(order_id).await;
}

#[tokio::test]
async fn test_confirmation_with_released_hold_fails_order() {
    let sys = System::with_defaults().await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;
    let saga = sys.saga(correlation_id).await;
    let order_id = saga.order_id.unwrap();

    // One hold is released on its own; the orchestrator records it.
    sys.ledger
        .release(saga.payload.items[0].reservation_id, correlation_id, "released")
        .await
        .unwrap();
    sys.deliver_all(Domain::Orders.queue()).await;
    assert_eq!(sys.saga(correlation_id).await.status, SagaStatus::OrderPlaced);
    assert!(matches!(
        sys.orders.confirm(order_id).await,
        Err(SagaError::ReservationLapsed(_))
    ));

    // A confirmation that arrives anyway fails the order.
    sys.publisher
        .publish(correlation_id, &messaging::OrderConfirmed { order_id })
        .await
        .unwrap();
    sys.broker.deliver_next(Domain::Orders.queue()).await.unwrap();
    assert_eq!(
        sys.saga(correlation_id).await.status,
        SagaStatus::CompensationInProgress
    );
    sys.broker.drain().await;

    let saga = sys.saga(correlation_id).await;
    assert_eq!(saga.status, SagaStatus::Failed);
    assert_eq!(saga.payload.failure.unwrap().reason, "reservation_expired");
    sys.assert_stock_untouched(order_id).await;
}

#[tokio::test]
async fn test_confirm_then_cancel_completes_on_both_sides() {
    let sys = System::with_defaults().await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;
    let order_id = sys.saga(correlation_id).await.order_id.unwrap();

    sys.orders.confirm(order_id).await.unwrap();
    sys.orders.cancel(order_id, None).await.unwrap();
    sys.deliver_all(Domain::Products.queue()).await;
    sys.broker.drain().await;

    assert_eq!(sys.saga(correlation_id).await.status, SagaStatus::Completed);
    assert_eq!(sys.order(correlation_id).await.status, OrderStatus::Confirmed);
    assert_eq!(sys.held(order_id).await, 0);
    assert_eq!(sys.rows(order_id, ReservationStatus::Fulfilled).await, 2);
    assert_eq!(sys.total_stock(1).await, 8);
    assert_eq!(sys.total_stock(2).await, 9);
}

#[tokio::test]
async fn test_cancel_then_confirm_fulfils_nothing() {
    let sys = System::with_defaults().await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;
    let order_id = sys.saga(correlation_id).await.order_id.unwrap();

    sys.orders.cancel(order_id, None).await.unwrap();
    sys.orders.confirm(order_id).await.unwrap();
    sys.deliver_all(Domain::Products.queue()).await;
    sys.broker.drain().await;

    let saga = sys.saga(correlation_id).await;
    assert_eq!(saga.status, SagaStatus::Cancelled);
    assert_eq!(sys.order(correlation_id).await.status, OrderStatus::Cancelled);
    sys.assert_stock_untouched(order_id).await;
    let entries = sys.sagas.compensations(order_id).await.unwrap();
    assert!(entries.iter().all(|e| e.status == CompensationStatus::Completed));
}

#[tokio::test]
async fn test_lost_terminal_event_is_published_again_by_sweep() {
    let config = SagaConfig {
        compensation_timeout: Duration::ZERO,
        ..SagaConfig::default()
    };
    let sys = System::start(config, Duration::ZERO).await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;
    let order_id = sys.saga(correlation_id).await.order_id.unwrap();

    sys.ledger.expire_due(100).await.unwrap();
    // The failure decision is stored but its OrderFailed never goes out.
    sys.broker.fail_publishes(1).await;
    sys.broker.deliver_next(Domain::Orders.queue()).await.unwrap();
    assert!(sys.broker.published_of("OrderFailed").await.is_empty());
    sys.broker.drain().await;
    assert_eq!(
        sys.saga(correlation_id).await.status,
        SagaStatus::CompensationInProgress
    );

    let report = sys.sweeper.run_once().await.unwrap();
    assert_eq!(report.republished, 1);
    sys.broker.drain().await;

    let saga = sys.saga(correlation_id).await;
    assert_eq!(saga.status, SagaStatus::Failed);
    assert_eq!(saga.payload.failure.unwrap().reason, "reservation_expired");
    sys.assert_stock_untouched(order_id).await;
}

#[tokio::test]
async fn test_unconfirmed_compensation_is_marked_failed() {
    let config = SagaConfig {
        saga_timeout: Duration::ZERO,
        compensation_timeout: Duration::ZERO,
    };
    let sys = System::start(config, Duration::from_secs(1800)).await;
    sys.prepare(&[(1, 10), (2, 10)], &scenario_cart()).await;
    let correlation_id = sys.checkout().await;
    let order_id = sys.saga(correlation_id).await.order_id.unwrap();

    // Inventory never gets to react: only the orders queue is consumed.
    sys.orders.cancel(order_id, None).await.unwrap();
    while sys
        .broker
        .deliver_next(Domain::Orders.queue())
        .await
        .is_some()
    {}
    assert_eq!(sys.saga(correlation_id).await.status, SagaStatus::Cancelled);

    let report = sys.sweeper.run_once().await.unwrap();
    assert_eq!(report.unconfirmed, 2);
    let entries = sys.sagas.compensations(order_id).await.unwrap();
    assert!(entries.iter().all(|e| e.status == CompensationStatus::Failed));

    assert_eq!(sys.sweeper.run_once().await.unwrap().unconfirmed, 0);
}

#[tokio::test]
async fn test_release_for_unknown_saga_is_dead_lettered_after_retries() {
    let sys = System::with_defaults().await;

    sys.publisher
        .publish(
            CorrelationId::new(),
            &StockReleased {
                product_id: None,
                quantity: 0,
                reservation_id: common::ReservationId::new(),
                order_id: None,
                reason: "unknown_reservation".into(),
            },
        )
        .await
        .unwrap();
    sys.broker.drain().await;

    let dead = sys.broker.dead_letters(Domain::Orders.queue()).await;
    assert_eq!(dead.len(), 1);
    assert!(dead[0].death_reason.as_deref().unwrap().contains("Saga not found"));
}

#[tokio::test]
async fn test_confirmation_outside_order_placed_is_ignored() {
    let config = SagaConfig {
        saga_timeout: Duration::ZERO,
        ..SagaConfig::default()
    };
    let sys = System::start(config, Duration::from_secs(1800)).await;
    sys.prepare(&[(1, 0)], &[(1, 1, 1000)]).await;
    let correlation_id = sys.checkout().await;
    let order_id = sys.saga(correlation_id).await.order_id.unwrap();

    sys.publisher
        .publish(correlation_id, &messaging::OrderConfirmed { order_id })
        .await
        .unwrap();
    sys.broker.drain().await;

    assert_eq!(
        sys.saga(correlation_id).await.status,
        SagaStatus::CheckingInventory
    );
    assert!(sys.broker.dead_letters(Domain::Orders.queue()).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_place_order_once() {
    let broker = InMemoryBroker::new(Topology::checkout());
    let publisher = EventPublisher::new(Arc::new(broker.clone()));
    let sagas = InMemorySagaStore::new();
    let orchestrator = SagaOrchestrator::new(
        Arc::new(sagas.clone()),
        publisher.clone(),
        SagaConfig::default(),
    );
    let guard = IdempotencyGuard::new(
        Arc::new(InMemoryIdempotencyStore::new()),
        Domain::Orders.service_name(),
    );
    let dispatcher = Arc::new(orchestrator.dispatcher(guard, RetryPolicy::immediate(25)));

    let correlation_id = CorrelationId::new();
    let items: Vec<LineItem> = (1..=6)
        .map(|p| LineItem::new(ProductId::new(p), 1, Money::from_cents(100)))
        .collect();
    orchestrator
        .start(
            correlation_id,
            CartCheckoutInitiated {
                cart_id: CartId::new(CART),
                user_id: UserId::new(USER),
                total: Money::from_cents(600),
                items,
            },
        )
        .await
        .unwrap();
    let saga = sagas.get(correlation_id).await.unwrap().unwrap();
    let order_id = saga.order_id.unwrap();

    let mut handles = Vec::new();
    for line in saga.payload.items.clone() {
        let dispatcher = dispatcher.clone();
        let envelope = EventEnvelope::wrap(
            correlation_id,
            &StockReserved {
                product_id: line.product_id,
                quantity: line.quantity,
                order_id,
                reservation_id: line.reservation_id,
            },
        )
        .unwrap();
        handles.push(tokio::spawn(async move {
            dispatcher.handle(&envelope.to_bytes().unwrap()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let saga = sagas.get(correlation_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::OrderPlaced);
    assert_eq!(saga.payload.reserved.len(), 6);
    assert_eq!(broker.published_of("OrderPlaced").await.len(), 1);
    assert_eq!(sagas.compensations(order_id).await.unwrap().len(), 6);
}
