//! PostgreSQL 账户存储

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use payment_shared::config::ReversalPolicy;
use payment_shared::events::{AccountKind, PaymentEventType};

use super::{AccountStore, ApplyOutcome, BalanceMutation};
use crate::error::{ReconcileError, Result};

pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn table(kind: AccountKind) -> &'static str {
        match kind {
            AccountKind::Card => "cards",
            AccountKind::Customer => "customers",
        }
    }

    async fn has_applied(
        conn: &mut PgConnection,
        payment_id: i64,
        event_type: PaymentEventType,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM balance_mutations WHERE payment_id = $1 AND event_type = $2)",
        )
        .bind(payment_id)
        .bind(event_type)
        .fetch_one(conn)
        .await?;
        Ok(exists)
    }

    /// 写入去重记录，已存在时返回 false
    async fn record(conn: &mut PgConnection, mutation: &BalanceMutation) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO balance_mutations (payment_id, event_type, account_kind, account_id, delta)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (payment_id, event_type) DO NOTHING
            "#,
        )
        .bind(mutation.payment_id)
        .bind(mutation.event_type)
        .bind(mutation.account_kind)
        .bind(mutation.account_id)
        .bind(mutation.delta)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn adjust_balance(conn: &mut PgConnection, mutation: &BalanceMutation) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET balance = balance + $1, updated_at = NOW() WHERE id = $2",
            Self::table(mutation.account_kind)
        );
        let result = sqlx::query(&sql)
            .bind(mutation.delta)
            .bind(mutation.account_id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn apply_once(
        &self,
        mutation: &BalanceMutation,
        policy: ReversalPolicy,
    ) -> Result<ApplyOutcome> {
        let mut tx = self.pool.begin().await?;

        if mutation.requires_prior_debit(policy)
            && !Self::has_applied(&mut tx, mutation.payment_id, PaymentEventType::Created).await?
        {
            tx.rollback().await?;
            return Ok(ApplyOutcome::SkippedNoPriorDebit);
        }

        if !Self::record(&mut tx, mutation).await? {
            tx.rollback().await?;
            return Ok(ApplyOutcome::Duplicate);
        }

        if !Self::adjust_balance(&mut tx, mutation).await? {
            // 去重记录随事务一起回滚
            tx.rollback().await?;
            return Err(ReconcileError::AccountNotFound {
                kind: mutation.account_kind,
                id: mutation.account_id,
            });
        }

        tx.commit().await?;
        debug!(
            payment_id = mutation.payment_id,
            event_type = %mutation.event_type,
            account_kind = %mutation.account_kind,
            account_id = mutation.account_id,
            delta = %mutation.delta,
            "余额变动已落账"
        );
        Ok(ApplyOutcome::Applied)
    }

    async fn balance(&self, kind: AccountKind, account_id: i64) -> Result<Option<Decimal>> {
        let sql = format!("SELECT balance FROM {} WHERE id = $1", Self::table(kind));
        let balance: Option<Decimal> = sqlx::query_scalar(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(balance)
    }

    async fn purge_applied_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM balance_mutations WHERE applied_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
