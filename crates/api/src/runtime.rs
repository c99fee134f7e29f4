//! Service wiring: stores, broker, per-domain consumers and sweepers.
//!
//! Everything is built once from [`Config`] and handed to its consumers
//! explicitly. With `DATABASE_URL` unset every domain runs on in-memory
//! stores; with `AMQP_URL` unset the three domains share an in-process broker.

use std::sync::Arc;

use cart::{CartReactor, CartStore, CheckoutService, InMemoryCartStore, PostgresCartStore};
use idempotency::{
    IdempotencyGuard, IdempotencyStore, InMemoryIdempotencyStore, PostgresIdempotencyStore,
};
use inventory::{
    InMemoryInventoryStore, InventoryLedger, InventoryReactor, InventoryStore,
    PostgresInventoryStore, ReservationSweeper,
};
use messaging::{ChannelError, Domain, EventChannel, EventPublisher, InMemoryBroker, Topology};
use saga::{
    InMemorySagaStore, OrderService, PostgresSagaStore, SagaOrchestrator, SagaStore,
    SagaTimeoutSweeper,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::Config;

const MIGRATIONS: [(&str, &str); 4] = [
    (
        "001_create_idempotency_records",
        include_str!("../../../migrations/001_create_idempotency_records.sql"),
    ),
    (
        "002_create_inventory_tables",
        include_str!("../../../migrations/002_create_inventory_tables.sql"),
    ),
    (
        "003_create_saga_tables",
        include_str!("../../../migrations/003_create_saga_tables.sql"),
    ),
    (
        "004_create_carts",
        include_str!("../../../migrations/004_create_carts.sql"),
    ),
];

/// Errors that abort service startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("AMQP_URL is set but the service was built without the `amqp` feature")]
    AmqpDisabled,
}

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub checkout: CheckoutService,
    pub orders: OrderService,
    pub inventory: InventoryLedger,
}

/// One store per domain plus the shared idempotency table.
#[derive(Clone)]
pub struct Stores {
    pub carts: Arc<dyn CartStore>,
    pub inventory: Arc<dyn InventoryStore>,
    pub sagas: Arc<dyn SagaStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            carts: Arc::new(InMemoryCartStore::new()),
            inventory: Arc::new(InMemoryInventoryStore::new()),
            sagas: Arc::new(InMemorySagaStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            carts: Arc::new(PostgresCartStore::new(pool.clone())),
            inventory: Arc::new(PostgresInventoryStore::new(pool.clone())),
            sagas: Arc::new(PostgresSagaStore::new(pool.clone())),
            idempotency: Arc::new(PostgresIdempotencyStore::new(pool)),
        }
    }
}

/// A fully wired service that has not started consuming yet.
pub struct Runtime {
    state: Arc<AppState>,
    channel: Arc<dyn EventChannel>,
    reservation_sweeper: ReservationSweeper,
    saga_sweeper: SagaTimeoutSweeper,
}

impl Runtime {
    /// Builds every domain service and subscribes its dispatcher to the
    /// domain's queue on `channel`.
    pub async fn wire(
        config: &Config,
        stores: Stores,
        channel: Arc<dyn EventChannel>,
    ) -> Result<Self, StartupError> {
        let publisher = EventPublisher::new(channel.clone());
        let retry = config.retry_policy();

        let checkout = CheckoutService::new(stores.carts.clone(), publisher.clone());
        let carts = CartReactor::new(stores.carts.clone())
            .dispatcher(guard(&stores, Domain::Cart), retry);
        channel.subscribe(Domain::Cart.queue(), Arc::new(carts)).await?;

        let ledger = InventoryLedger::new(stores.inventory.clone(), publisher.clone())
            .with_reservation_ttl(config.reservation_ttl);
        let products = InventoryReactor::new(ledger.clone())
            .dispatcher(guard(&stores, Domain::Products), retry);
        channel.subscribe(Domain::Products.queue(), Arc::new(products)).await?;

        let orchestrator =
            SagaOrchestrator::new(stores.sagas.clone(), publisher.clone(), config.saga_config());
        let orders = orchestrator.dispatcher(guard(&stores, Domain::Orders), retry);
        channel.subscribe(Domain::Orders.queue(), Arc::new(orders)).await?;

        let state = Arc::new(AppState {
            checkout,
            orders: OrderService::new(stores.sagas.clone(), publisher.clone()),
            inventory: ledger.clone(),
        });

        Ok(Self {
            state,
            channel,
            reservation_sweeper: ReservationSweeper::new(ledger, config.sweep_interval),
            saga_sweeper: SagaTimeoutSweeper::new(orchestrator, config.sweep_interval),
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Starts the queue consumers and both sweepers.
    ///
    /// Returns the shared state and the sweeper tasks.
    pub async fn start(self) -> Result<(Arc<AppState>, Vec<JoinHandle<()>>), StartupError> {
        self.channel.start_consuming().await?;
        let tasks = vec![self.reservation_sweeper.spawn(), self.saga_sweeper.spawn()];
        tracing::info!("consumers and sweepers started");
        Ok((self.state, tasks))
    }
}

fn guard(stores: &Stores, domain: Domain) -> IdempotencyGuard {
    IdempotencyGuard::new(stores.idempotency.clone(), domain.service_name())
}

/// Applies the SQL migrations in order. Every statement is idempotent.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    for (name, sql) in MIGRATIONS {
        sqlx::raw_sql(sql).execute(pool).await?;
        tracing::debug!(migration = name, "migration applied");
    }
    Ok(())
}

async fn connect_stores(config: &Config) -> Result<Stores, StartupError> {
    let Some(url) = &config.database_url else {
        tracing::warn!("DATABASE_URL not set, using in-memory stores");
        return Ok(Stores::in_memory());
    };

    let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
    run_migrations(&pool).await?;
    tracing::info!("connected to PostgreSQL");
    Ok(Stores::postgres(pool))
}

async fn connect_channel(config: &Config) -> Result<Arc<dyn EventChannel>, StartupError> {
    match &config.amqp_url {
        #[cfg(feature = "amqp")]
        Some(url) => {
            let channel =
                messaging::AmqpChannel::connect(url, Topology::checkout(), config.publish_timeout)
                    .await?;
            Ok(Arc::new(channel))
        }
        #[cfg(not(feature = "amqp"))]
        Some(_) => Err(StartupError::AmqpDisabled),
        None => {
            tracing::warn!("AMQP_URL not set, using the in-process broker");
            Ok(Arc::new(InMemoryBroker::new(Topology::checkout())))
        }
    }
}

/// Connects stores and broker as configured and wires the service.
pub async fn build_runtime(config: &Config) -> Result<Runtime, StartupError> {
    let stores = connect_stores(config).await?;
    let channel = connect_channel(config).await?;
    Runtime::wire(config, stores, channel).await
}
