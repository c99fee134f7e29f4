use async_trait::async_trait;
use messaging::EventId;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{IdempotencyRecord, IdempotencyStore, Result};

/// PostgreSQL-backed idempotency store over `idempotency_records`.
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: PgRow) -> Result<IdempotencyRecord> {
        Ok(IdempotencyRecord {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            service_name: row.try_get("service_name")?,
            action: row.try_get("action")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn is_processed(&self, event_id: EventId, service_name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM idempotency_records WHERE event_id = $1 AND service_name = $2)",
        )
        .bind(event_id.as_uuid())
        .bind(service_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn record_processed(&self, record: IdempotencyRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_records (event_id, service_name, action, result, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id, service_name) DO NOTHING
            "#,
        )
        .bind(record.event_id.as_uuid())
        .bind(&record.service_name)
        .bind(&record.action)
        .bind(&record.result)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(
        &self,
        event_id: EventId,
        service_name: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT event_id, service_name, action, result, created_at
            FROM idempotency_records
            WHERE event_id = $1 AND service_name = $2
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(service_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }
}
