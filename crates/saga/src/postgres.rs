use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CartId, CorrelationId, Money, OrderId, ProductId, ReservationId, UserId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CompensationEntry, CreateOutcome, Order, OrderReservation, OrderStatus, RecordedReservation,
    Result, SagaError, SagaState, SagaStatus, SagaStore,
};

const SAGA_COLUMNS: &str = "id, correlation_id, saga_type, status, order_id, cart_id, user_id, payload, compensation_log, version, created_at, updated_at, expires_at";
const ORDER_COLUMNS: &str =
    "order_id, correlation_id, user_id, cart_id, items, total_cents, status, created_at, updated_at";
const MIRROR_COLUMNS: &str =
    "reservation_id, order_id, product_id, quantity, status, created_at, released_at";
const COMPENSATION_COLUMNS: &str = "id, order_id, correlation_id, compensation_event, compensation_payload, status, created_at, completed_at";

/// PostgreSQL-backed order domain store over `saga_states`, `orders`,
/// `order_reservations` and `compensation_log`.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_saga(row: PgRow) -> Result<SagaState> {
        let status: String = row.try_get("status")?;
        let payload: serde_json::Value = row.try_get("payload")?;
        let compensation_log: serde_json::Value = row.try_get("compensation_log")?;
        Ok(SagaState {
            id: row.try_get("id")?,
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            saga_type: row.try_get("saga_type")?,
            status: status.parse()?,
            order_id: row
                .try_get::<Option<Uuid>, _>("order_id")?
                .map(OrderId::from_uuid),
            cart_id: CartId::new(row.try_get("cart_id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            payload: serde_json::from_value(payload)?,
            compensation_log: serde_json::from_value(compensation_log)?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        let status: String = row.try_get("status")?;
        let items: serde_json::Value = row.try_get("items")?;
        Ok(Order {
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            cart_id: CartId::new(row.try_get("cart_id")?),
            items: serde_json::from_value(items)?,
            total: Money::from_cents(row.try_get("total_cents")?),
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_mirror(row: PgRow) -> Result<OrderReservation> {
        let status: String = row.try_get("status")?;
        Ok(OrderReservation {
            reservation_id: ReservationId::from_uuid(row.try_get::<Uuid, _>("reservation_id")?),
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            product_id: ProductId::new(row.try_get("product_id")?),
            quantity: row.try_get::<i32, _>("quantity")? as u32,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            released_at: row.try_get("released_at")?,
        })
    }

    fn row_to_compensation(row: PgRow) -> Result<CompensationEntry> {
        let event: String = row.try_get("compensation_event")?;
        let status: String = row.try_get("status")?;
        Ok(CompensationEntry {
            id: row.try_get("id")?,
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            compensation_event: event.parse()?,
            compensation_payload: row.try_get("compensation_payload")?,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    async fn find_saga(&self, column: &str, id: Uuid) -> Result<Option<SagaState>> {
        let row = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga_states WHERE {column} = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }
}

fn status_names(statuses: &[SagaStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn create(&self, saga: &SagaState, order: &Order) -> Result<CreateOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO saga_states
                (id, correlation_id, saga_type, status, order_id, cart_id, user_id,
                 payload, compensation_log, version, created_at, updated_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 1, $10, $10, $11)
            ON CONFLICT (correlation_id) DO NOTHING
            RETURNING {SAGA_COLUMNS}
            "#
        ))
        .bind(saga.id)
        .bind(saga.correlation_id.as_uuid())
        .bind(saga.saga_type.as_str())
        .bind(saga.status.as_str())
        .bind(saga.order_id.map(|id| id.as_uuid()))
        .bind(saga.cart_id.as_i64())
        .bind(saga.user_id.as_i64())
        .bind(serde_json::to_value(&saga.payload)?)
        .bind(serde_json::to_value(&saga.compensation_log)?)
        .bind(saga.created_at)
        .bind(saga.expires_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            tx.rollback().await?;
            let existing = self
                .get(saga.correlation_id)
                .await?
                .ok_or(SagaError::SagaNotFound(saga.correlation_id))?;
            return Ok(CreateOutcome::Existing(existing));
        };

        sqlx::query(
            r#"
            INSERT INTO orders
                (order_id, correlation_id, user_id, cart_id, items, total_cents, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            "#,
        )
        .bind(order.order_id.as_uuid())
        .bind(order.correlation_id.as_uuid())
        .bind(order.user_id.as_i64())
        .bind(order.cart_id.as_i64())
        .bind(serde_json::to_value(&order.items)?)
        .bind(order.total.cents())
        .bind(order.status.as_str())
        .bind(order.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CreateOutcome::Created(Self::row_to_saga(row)?))
    }

    async fn get(&self, correlation_id: CorrelationId) -> Result<Option<SagaState>> {
        self.find_saga("correlation_id", correlation_id.as_uuid())
            .await
    }

    async fn find_by_order(&self, order_id: OrderId) -> Result<Option<SagaState>> {
        self.find_saga("order_id", order_id.as_uuid()).await
    }

    async fn update(&self, saga: &SagaState, now: DateTime<Utc>) -> Result<SagaState> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE saga_states
            SET status = $3, order_id = $4, payload = $5, compensation_log = $6,
                expires_at = $7, updated_at = $8, version = version + 1
            WHERE correlation_id = $1 AND version = $2
            RETURNING {SAGA_COLUMNS}
            "#
        ))
        .bind(saga.correlation_id.as_uuid())
        .bind(saga.version)
        .bind(saga.status.as_str())
        .bind(saga.order_id.map(|id| id.as_uuid()))
        .bind(serde_json::to_value(&saga.payload)?)
        .bind(serde_json::to_value(&saga.compensation_log)?)
        .bind(saga.expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_saga(row),
            None => Err(SagaError::ConcurrencyConflict {
                correlation_id: saga.correlation_id,
                expected: saga.version,
            }),
        }
    }

    async fn expired(
        &self,
        statuses: &[SagaStatus],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaState>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SAGA_COLUMNS} FROM saga_states
            WHERE status = ANY($1) AND expires_at <= $2
            ORDER BY expires_at
            LIMIT $3
            "#
        ))
        .bind(status_names(statuses))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn overdue_compensations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaState>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SAGA_COLUMNS} FROM saga_states s
            WHERE s.status IN ('failed', 'cancelled') AND s.expires_at <= $1
              AND EXISTS (SELECT 1 FROM compensation_log c
                          WHERE c.order_id = s.order_id AND c.status = 'pending')
            ORDER BY s.expires_at
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = $1"
        ))
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_order).transpose()
    }

    async fn set_order_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE orders SET status = $2, updated_at = $3 WHERE order_id = $1")
            .bind(order_id.as_uuid())
            .bind(status.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SagaError::OrderNotFound(order_id));
        }
        Ok(())
    }

    async fn record_reservation(
        &self,
        mirror: OrderReservation,
        entry: CompensationEntry,
    ) -> Result<RecordedReservation> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO order_reservations
                (reservation_id, order_id, product_id, quantity, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (reservation_id) DO NOTHING
            RETURNING {MIRROR_COLUMNS}
            "#
        ))
        .bind(mirror.reservation_id.as_uuid())
        .bind(mirror.order_id.as_uuid())
        .bind(mirror.product_id.as_i64())
        .bind(mirror.quantity as i32)
        .bind(mirror.status.as_str())
        .bind(mirror.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            let row = sqlx::query(&format!(
                "SELECT {MIRROR_COLUMNS} FROM order_reservations WHERE reservation_id = $1"
            ))
            .bind(mirror.reservation_id.as_uuid())
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(RecordedReservation {
                mirror: Self::row_to_mirror(row)?,
                inserted: false,
            });
        };

        sqlx::query(
            r#"
            INSERT INTO compensation_log
                (order_id, correlation_id, compensation_event, compensation_payload, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(entry.order_id.as_uuid())
        .bind(entry.correlation_id.as_uuid())
        .bind(entry.compensation_event.as_str())
        .bind(entry.compensation_payload)
        .bind(entry.status.as_str())
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RecordedReservation {
            mirror: Self::row_to_mirror(row)?,
            inserted: true,
        })
    }

    async fn reservations(&self, order_id: OrderId) -> Result<Vec<OrderReservation>> {
        let rows = sqlx::query(&format!(
            "SELECT {MIRROR_COLUMNS} FROM order_reservations WHERE order_id = $1 ORDER BY created_at, reservation_id"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_mirror).collect()
    }

    async fn release_reservation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<Option<OrderReservation>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE order_reservations
            SET status = 'released', released_at = $2
            WHERE reservation_id = $1 AND status = 'reserved'
            RETURNING {MIRROR_COLUMNS}
            "#
        ))
        .bind(reservation_id.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_mirror).transpose()
    }

    async fn compensations(&self, order_id: OrderId) -> Result<Vec<CompensationEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {COMPENSATION_COLUMNS} FROM compensation_log WHERE order_id = $1 ORDER BY id"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_compensation).collect()
    }

    async fn complete_compensation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE compensation_log
            SET status = 'completed', completed_at = $2
            WHERE compensation_event = 'release_reservation'
              AND compensation_payload ->> 'reservation_id' = $1
              AND status = 'pending'
            "#,
        )
        .bind(reservation_id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_pending_compensations(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<Vec<CompensationEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE compensation_log
            SET status = 'failed', completed_at = $2
            WHERE order_id = $1 AND status = 'pending'
            RETURNING {COMPENSATION_COLUMNS}
            "#
        ))
        .bind(order_id.as_uuid())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut failed = rows
            .into_iter()
            .map(Self::row_to_compensation)
            .collect::<Result<Vec<_>>>()?;
        failed.sort_by_key(|e| e.id);
        Ok(failed)
    }
}
