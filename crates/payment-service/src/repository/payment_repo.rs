//! 支付记录仓储（PostgreSQL）

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};

use payment_shared::events::{PaymentEventType, PaymentStatus};

use super::outbox_repo::OutboxRepository;
use super::traits::PaymentRepositoryTrait;
use crate::error::Result;
use crate::models::{NewPayment, Payment, PaymentFilter};

const PAYMENT_COLUMNS: &str = "id, customer_id, card_id, amount, payment_type, status, description, created_at, updated_at";

pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_in_tx(conn: &mut PgConnection, payment: &NewPayment) -> Result<Payment> {
        let created = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments (customer_id, card_id, amount, payment_type, status, description)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment.customer_id)
        .bind(payment.card_id)
        .bind(payment.amount)
        .bind(payment.payment_type)
        .bind(payment.status)
        .bind(&payment.description)
        .fetch_one(conn)
        .await?;

        Ok(created)
    }

    async fn transition_in_tx(
        conn: &mut PgConnection,
        payment: &Payment,
        from: &[PaymentStatus],
    ) -> Result<Option<Payment>> {
        let from: Vec<&str> = from.iter().map(PaymentStatus::as_str).collect();

        // 状态条件与写入在同一条语句内完成，并发的迁移只有一个能命中
        let updated = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET status = $2, description = $3, updated_at = NOW()
            WHERE id = $1 AND status = ANY($4)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment.id)
        .bind(payment.status)
        .bind(&payment.description)
        .bind(&from)
        .fetch_optional(conn)
        .await?;

        Ok(updated)
    }
}

#[async_trait]
impl PaymentRepositoryTrait for PaymentRepository {
    async fn create(&self, payment: &NewPayment) -> Result<Payment> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_in_tx(&mut conn, payment).await
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    async fn transition(
        &self,
        payment: &Payment,
        from: &[PaymentStatus],
    ) -> Result<Option<Payment>> {
        let mut conn = self.pool.acquire().await?;
        Self::transition_in_tx(&mut conn, payment, from).await
    }

    async fn list(&self, filter: &PaymentFilter) -> Result<Vec<Payment>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE customer_id = "));
        query.push_bind(filter.customer_id);

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status);
        }
        if let Some(from) = filter.from {
            query.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            query.push(" AND created_at <= ").push_bind(to);
        }
        query.push(" ORDER BY created_at DESC, id DESC");

        let payments = query
            .build_query_as::<Payment>()
            .fetch_all(&self.pool)
            .await?;

        Ok(payments)
    }

    async fn create_with_outbox(
        &self,
        payment: &NewPayment,
        event_type: PaymentEventType,
    ) -> Result<Payment> {
        let mut tx = self.pool.begin().await?;

        let created = Self::insert_in_tx(&mut tx, payment).await?;
        OutboxRepository::insert_in_tx(&mut tx, &created.to_event(event_type)).await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn transition_with_outbox(
        &self,
        payment: &Payment,
        from: &[PaymentStatus],
        event_type: PaymentEventType,
    ) -> Result<Option<Payment>> {
        let mut tx = self.pool.begin().await?;

        let Some(updated) = Self::transition_in_tx(&mut tx, payment, from).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        OutboxRepository::insert_in_tx(&mut tx, &updated.to_event(event_type)).await?;

        tx.commit().await?;
        Ok(Some(updated))
    }
}
