use async_trait::async_trait;
use common::{CartId, CorrelationId, UserId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{Cart, CartError, CartStatus, CartStore, Result};

/// PostgreSQL-backed cart store over `carts`.
///
/// Checkout and outcome transitions lock the row with `FOR UPDATE` and
/// reuse the model's transition rules.
#[derive(Clone)]
pub struct PostgresCartStore {
    pool: PgPool,
}

impl PostgresCartStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_cart(row: PgRow) -> Result<Cart> {
        let status: String = row.try_get("status")?;
        let items: serde_json::Value = row.try_get("items")?;
        Ok(Cart {
            cart_id: CartId::new(row.try_get("cart_id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            items: serde_json::from_value(items)?,
            status: status.parse()?,
            checkout_correlation_id: row
                .try_get::<Option<Uuid>, _>("checkout_correlation_id")?
                .map(CorrelationId::from_uuid),
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn write<'e, E>(executor: E, cart: &Cart) -> Result<()>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO carts (cart_id, user_id, items, status, checkout_correlation_id, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (cart_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                items = EXCLUDED.items,
                status = EXCLUDED.status,
                checkout_correlation_id = EXCLUDED.checkout_correlation_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(cart.cart_id.as_i64())
        .bind(cart.user_id.as_i64())
        .bind(serde_json::to_value(&cart.items)?)
        .bind(cart.status.as_str())
        .bind(cart.checkout_correlation_id.map(|c| c.as_uuid()))
        .bind(cart.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }
}

const CART_COLUMNS: &str = "cart_id, user_id, items, status, checkout_correlation_id, updated_at";

#[async_trait]
impl CartStore for PostgresCartStore {
    async fn get(&self, cart_id: CartId) -> Result<Option<Cart>> {
        let row = sqlx::query(&format!("SELECT {CART_COLUMNS} FROM carts WHERE cart_id = $1"))
            .bind(cart_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_cart).transpose()
    }

    async fn save(&self, cart: &Cart) -> Result<()> {
        Self::write(&self.pool, cart).await
    }

    async fn begin_checkout(&self, cart_id: CartId, correlation_id: CorrelationId) -> Result<Cart> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {CART_COLUMNS} FROM carts WHERE cart_id = $1 FOR UPDATE"
        ))
        .bind(cart_id.as_i64())
        .fetch_optional(&mut *tx)
        .await?;
        let mut cart = row
            .map(Self::row_to_cart)
            .transpose()?
            .ok_or(CartError::NotFound(cart_id))?;

        cart.begin_checkout(correlation_id)?;
        Self::write(&mut *tx, &cart).await?;
        tx.commit().await?;
        Ok(cart)
    }

    async fn apply_outcome(
        &self,
        correlation_id: CorrelationId,
        target: CartStatus,
    ) -> Result<Option<Cart>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {CART_COLUMNS} FROM carts WHERE checkout_correlation_id = $1 FOR UPDATE"
        ))
        .bind(correlation_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(mut cart) = row.map(Self::row_to_cart).transpose()? else {
            return Ok(None);
        };

        if !cart.apply_outcome(correlation_id, target) {
            return Ok(None);
        }
        Self::write(&mut *tx, &cart).await?;
        tx.commit().await?;
        Ok(Some(cart))
    }
}
