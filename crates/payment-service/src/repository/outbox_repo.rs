//! 事务性 outbox 仓储（PostgreSQL）

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};

use payment_shared::events::PaymentEvent;

use super::traits::OutboxStore;
use crate::error::Result;
use crate::models::OutboxEntry;

pub struct OutboxRepository {
    pool: PgPool,
}

impl OutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 在调用方事务内写入一条待发送事件
    pub async fn insert_in_tx(conn: &mut PgConnection, event: &PaymentEvent) -> Result<i64> {
        let payload = serde_json::to_value(event)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO payment_event_outbox (payment_id, event_type, payload)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(event.payment_id)
        .bind(event.event_type.as_str())
        .bind(payload)
        .fetch_one(conn)
        .await?;

        Ok(id)
    }
}

#[async_trait]
impl OutboxStore for OutboxRepository {
    async fn fetch_unpublished(&self, limit: i64, max_attempts: i32) -> Result<Vec<OutboxEntry>> {
        let entries = sqlx::query_as::<_, OutboxEntry>(
            r#"
            SELECT o.id, o.payment_id, o.event_type, o.payload, o.attempts, o.last_error, o.created_at
            FROM payment_event_outbox o
            WHERE o.published_at IS NULL
              AND o.attempts < $2
              AND NOT EXISTS (
                  SELECT 1 FROM payment_event_outbox parked
                  WHERE parked.payment_id = o.payment_id
                    AND parked.id < o.id
                    AND parked.published_at IS NULL
                    AND parked.attempts >= $2
              )
            ORDER BY o.id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn mark_published(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE payment_event_outbox SET published_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE payment_event_outbox SET attempts = attempts + 1, last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
