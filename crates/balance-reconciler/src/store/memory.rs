//! 内存账户存储
//!
//! 单把锁保护余额与去重记录，使"检查 + 落账 + 记录"成为一个原子步骤。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use payment_shared::config::ReversalPolicy;
use payment_shared::events::{AccountKind, PaymentEventType};

use super::{AccountStore, ApplyOutcome, BalanceMutation};
use crate::error::{ReconcileError, Result};

#[derive(Debug, Default)]
struct Ledger {
    balances: HashMap<(AccountKind, i64), Decimal>,
    applied: HashMap<(i64, PaymentEventType), (BalanceMutation, DateTime<Utc>)>,
}

#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    ledger: Mutex<Ledger>,
    unavailable: AtomicBool,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开立账户并设置初始余额
    pub fn open_account(&self, kind: AccountKind, account_id: i64, balance: Decimal) {
        self.ledger
            .lock()
            .balances
            .insert((kind, account_id), balance);
    }

    /// 模拟存储不可用，之后的落账调用返回 `Storage` 错误
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn applied_count(&self) -> usize {
        self.ledger.lock().applied.len()
    }

    pub fn is_applied(&self, payment_id: i64, event_type: PaymentEventType) -> bool {
        self.ledger
            .lock()
            .applied
            .contains_key(&(payment_id, event_type))
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ReconcileError::Storage("账户存储不可用".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn apply_once(
        &self,
        mutation: &BalanceMutation,
        policy: ReversalPolicy,
    ) -> Result<ApplyOutcome> {
        self.check_available()?;
        let mut ledger = self.ledger.lock();

        if mutation.requires_prior_debit(policy)
            && !ledger
                .applied
                .contains_key(&(mutation.payment_id, PaymentEventType::Created))
        {
            return Ok(ApplyOutcome::SkippedNoPriorDebit);
        }

        let key = (mutation.payment_id, mutation.event_type);
        if ledger.applied.contains_key(&key) {
            return Ok(ApplyOutcome::Duplicate);
        }

        let Some(balance) = ledger
            .balances
            .get_mut(&(mutation.account_kind, mutation.account_id))
        else {
            return Err(ReconcileError::AccountNotFound {
                kind: mutation.account_kind,
                id: mutation.account_id,
            });
        };
        *balance += mutation.delta;

        ledger.applied.insert(key, (mutation.clone(), Utc::now()));
        Ok(ApplyOutcome::Applied)
    }

    async fn balance(&self, kind: AccountKind, account_id: i64) -> Result<Option<Decimal>> {
        self.check_available()?;
        Ok(self.ledger.lock().balances.get(&(kind, account_id)).copied())
    }

    async fn purge_applied_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut ledger = self.ledger.lock();
        let before = ledger.applied.len();
        ledger.applied.retain(|_, (_, applied_at)| *applied_at >= cutoff);
        Ok((before - ledger.applied.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn debit(payment_id: i64, amount: Decimal) -> BalanceMutation {
        BalanceMutation {
            payment_id,
            event_type: PaymentEventType::Created,
            account_kind: AccountKind::Card,
            account_id: 7,
            delta: -amount,
        }
    }

    #[tokio::test]
    async fn test_missing_account_leaves_no_dedup_record() {
        let store = InMemoryAccountStore::new();

        let err = store
            .apply_once(&debit(1, dec!(10)), ReversalPolicy::Unconditional)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::AccountNotFound { id: 7, .. }));
        assert!(!store.is_applied(1, PaymentEventType::Created));

        // 账户开立后重新投递即可落账
        store.open_account(AccountKind::Card, 7, dec!(100));
        let outcome = store
            .apply_once(&debit(1, dec!(10)), ReversalPolicy::Unconditional)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(
            store.balance(AccountKind::Card, 7).await.unwrap(),
            Some(dec!(90))
        );
    }

    #[tokio::test]
    async fn test_unavailable_store_is_retryable() {
        let store = InMemoryAccountStore::new();
        store.open_account(AccountKind::Card, 7, dec!(100));
        store.set_unavailable(true);

        let err = store
            .apply_once(&debit(1, dec!(10)), ReversalPolicy::Unconditional)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        store.set_unavailable(false);
        assert_eq!(
            store.balance(AccountKind::Card, 7).await.unwrap(),
            Some(dec!(100))
        );
    }

    #[tokio::test]
    async fn test_purge_keeps_recent_records() {
        let store = InMemoryAccountStore::new();
        store.open_account(AccountKind::Card, 7, dec!(100));
        store
            .apply_once(&debit(1, dec!(10)), ReversalPolicy::Unconditional)
            .await
            .unwrap();

        let purged = store
            .purge_applied_before(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(purged, 0);

        let purged = store
            .purge_applied_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.applied_count(), 0);
    }
}
