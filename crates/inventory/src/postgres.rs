use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, OrderId, ProductId, ReservationId};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    InventoryError, InventoryStore, ReleaseOutcome, ReserveOutcome, Reservation,
    ReservationRequest, ReservationStatus, Result, StockLevel,
};

const RESERVATION_COLUMNS: &str = "reservation_id, product_id, quantity, order_id, correlation_id, status, created_at, expires_at, released_at, expiry_announced";

/// PostgreSQL-backed inventory store.
///
/// `reserve` locks the product's `product_stock` row, so reservations of
/// the same product serialize while different products proceed in
/// parallel.
#[derive(Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_reservation(row: PgRow) -> Result<Reservation> {
        let status: String = row.try_get("status")?;
        Ok(Reservation {
            reservation_id: ReservationId::from_uuid(row.try_get::<Uuid, _>("reservation_id")?),
            product_id: ProductId::new(row.try_get("product_id")?),
            quantity: row.try_get::<i32, _>("quantity")? as u32,
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            released_at: row.try_get("released_at")?,
            expiry_announced: row.try_get("expiry_announced")?,
        })
    }

    async fn find_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        reservation_id: ReservationId,
    ) -> Result<Option<Reservation>> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM inventory_reservations WHERE reservation_id = $1"
        ))
        .bind(reservation_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Self::row_to_reservation).transpose()
    }
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    async fn set_stock(&self, product_id: ProductId, total_stock: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO product_stock (product_id, total_stock, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (product_id) DO UPDATE SET total_stock = EXCLUDED.total_stock, updated_at = NOW()
            "#,
        )
        .bind(product_id.as_i64())
        .bind(total_stock)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stock_level(&self, product_id: ProductId) -> Result<Option<StockLevel>> {
        let row = sqlx::query(
            r#"
            SELECT s.total_stock,
                   COALESCE((SELECT SUM(r.quantity) FROM inventory_reservations r
                             WHERE r.product_id = s.product_id AND r.status = 'reserved'), 0)::BIGINT AS reserved
            FROM product_stock s
            WHERE s.product_id = $1
            "#,
        )
        .bind(product_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<StockLevel> {
            Ok(StockLevel {
                product_id,
                total_stock: row.try_get("total_stock")?,
                reserved: row.try_get("reserved")?,
            })
        })
        .transpose()
    }

    async fn reserve(
        &self,
        request: ReservationRequest,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome> {
        let mut tx = self.pool.begin().await?;

        let total: Option<i64> = sqlx::query_scalar(
            "SELECT total_stock FROM product_stock WHERE product_id = $1 FOR UPDATE",
        )
        .bind(request.product_id.as_i64())
        .fetch_optional(&mut *tx)
        .await?;

        // Checked under the product lock so a concurrent retry of the same
        // reservation observes the row.
        if let Some(existing) = Self::find_in_tx(&mut tx, request.reservation_id).await? {
            tx.commit().await?;
            return Ok(ReserveOutcome::Existing(existing));
        }
        if request.quantity == 0 {
            return Err(InventoryError::EmptyReservation(request.reservation_id));
        }
        let total = total.ok_or(InventoryError::UnknownProduct(request.product_id))?;

        let reserved: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM inventory_reservations WHERE product_id = $1 AND status = 'reserved'",
        )
        .bind(request.product_id.as_i64())
        .fetch_one(&mut *tx)
        .await?;

        let available = total - reserved;
        if available < i64::from(request.quantity) {
            return Err(InventoryError::InsufficientStock {
                product_id: request.product_id,
                requested: request.quantity,
                available,
            });
        }

        let reservation = request.into_reservation(now, expires_at);
        sqlx::query(
            r#"
            INSERT INTO inventory_reservations
                (reservation_id, product_id, quantity, order_id, correlation_id, status, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(reservation.reservation_id.as_uuid())
        .bind(reservation.product_id.as_i64())
        .bind(reservation.quantity as i32)
        .bind(reservation.order_id.as_uuid())
        .bind(reservation.correlation_id.as_uuid())
        .bind(reservation.status.as_str())
        .bind(reservation.created_at)
        .bind(reservation.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ReserveOutcome::Created(reservation))
    }

    async fn get(&self, reservation_id: ReservationId) -> Result<Option<Reservation>> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM inventory_reservations WHERE reservation_id = $1"
        ))
        .bind(reservation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_reservation).transpose()
    }

    async fn for_order(&self, order_id: OrderId) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM inventory_reservations WHERE order_id = $1 ORDER BY created_at, reservation_id"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_reservation).collect()
    }

    async fn release(
        &self,
        reservation_id: ReservationId,
        to: ReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE inventory_reservations
            SET status = $2, released_at = $3
            WHERE reservation_id = $1 AND status = 'reserved'
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(reservation_id.as_uuid())
        .bind(to.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(ReleaseOutcome::Released(Self::row_to_reservation(row)?));
        }

        Ok(match self.get(reservation_id).await? {
            Some(existing) => ReleaseOutcome::Unchanged(existing),
            None => ReleaseOutcome::NotFound,
        })
    }

    async fn fulfill_order(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>> {
        let mut tx = self.pool.begin().await?;

        // Row locks order this against a concurrent release or expiry.
        let statuses: Vec<String> = sqlx::query_scalar(
            "SELECT status FROM inventory_reservations WHERE order_id = $1 FOR UPDATE",
        )
        .bind(order_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;
        if statuses.iter().any(|s| s != ReservationStatus::Reserved.as_str()) {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            r#"
            UPDATE inventory_reservations
            SET status = 'fulfilled', released_at = $2
            WHERE order_id = $1 AND status = 'reserved'
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(order_id.as_uuid())
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let fulfilled = rows
            .into_iter()
            .map(Self::row_to_reservation)
            .collect::<Result<Vec<_>>>()?;

        for reservation in &fulfilled {
            sqlx::query(
                "UPDATE product_stock SET total_stock = total_stock - $2, updated_at = NOW() WHERE product_id = $1",
            )
            .bind(reservation.product_id.as_i64())
            .bind(i64::from(reservation.quantity))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(fulfilled)
    }

    async fn due_for_expiry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS} FROM inventory_reservations
            WHERE (status = 'reserved' AND expires_at <= $1)
               OR (status = 'expired' AND NOT expiry_announced)
            ORDER BY expires_at
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_reservation).collect()
    }

    async fn mark_expiry_announced(&self, reservation_id: ReservationId) -> Result<()> {
        sqlx::query(
            "UPDATE inventory_reservations SET expiry_announced = TRUE WHERE reservation_id = $1",
        )
        .bind(reservation_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
