//! 余额对账
//!
//! 把支付生命周期事件映射为余额变动并落账。创建事件扣款，取消事件回冲；
//! 同一 `(payment_id, event_type)` 只落账一次。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use payment_shared::config::ReversalPolicy;
use payment_shared::events::PaymentEvent;
use payment_shared::kafka::{EventHandler, HandlerError};
use payment_shared::observability::metrics::{record_balance_mutation, record_event_consumed};

use crate::error::Result;
use crate::store::{AccountStore, ApplyOutcome, BalanceMutation};

pub struct BalanceReconciler<S: AccountStore> {
    store: Arc<S>,
    policy: ReversalPolicy,
}

impl<S: AccountStore> BalanceReconciler<S> {
    pub fn new(store: Arc<S>, policy: ReversalPolicy) -> Self {
        Self { store, policy }
    }

    /// 对一个事件执行落账
    #[instrument(skip(self, event), fields(payment_id = event.payment_id, event_type = %event.event_type))]
    pub async fn apply(&self, event: &PaymentEvent) -> Result<ApplyOutcome> {
        let mutation = BalanceMutation::from_event(event)?;
        let started = Instant::now();

        let outcome = self.store.apply_once(&mutation, self.policy).await?;

        match outcome {
            ApplyOutcome::Applied => {
                record_balance_mutation(
                    mutation.account_kind.as_str(),
                    mutation.event_type.as_str(),
                    started.elapsed().as_secs_f64(),
                );
                info!(
                    account_kind = %mutation.account_kind,
                    account_id = mutation.account_id,
                    delta = %mutation.delta,
                    "余额已调整"
                );
            }
            ApplyOutcome::Duplicate => {
                info!("重复投递的事件，已忽略");
            }
            ApplyOutcome::SkippedNoPriorDebit => {
                warn!(
                    account_kind = %mutation.account_kind,
                    account_id = mutation.account_id,
                    "取消事件没有对应的已落账扣款，跳过回冲"
                );
            }
        }

        Ok(outcome)
    }
}

#[async_trait]
impl<S: AccountStore> EventHandler for BalanceReconciler<S> {
    async fn handle(&self, event: &PaymentEvent) -> std::result::Result<(), HandlerError> {
        match self.apply(event).await {
            Ok(outcome) => {
                record_event_consumed(outcome.as_str());
                Ok(())
            }
            Err(e) if e.is_retryable() => Err(HandlerError::retryable(e.to_string())),
            Err(e) => Err(HandlerError::permanent(e.to_string())),
        }
    }
}
