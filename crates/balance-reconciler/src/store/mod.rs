//! 账户存储
//!
//! 余额只通过 [`AccountStore::apply_once`] 修改：去重记录与余额调整在同一原子步骤内完成，
//! 二者要么同时生效，要么都不生效。

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use payment_shared::config::ReversalPolicy;
use payment_shared::events::{AccountKind, PaymentEvent, PaymentEventType, PaymentType};

use crate::error::{ReconcileError, Result};

pub use memory::InMemoryAccountStore;
pub use postgres::PgAccountStore;

/// 一次余额变动
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceMutation {
    pub payment_id: i64,
    pub event_type: PaymentEventType,
    pub account_kind: AccountKind,
    pub account_id: i64,
    /// 扣款为负，回冲为正
    pub delta: Decimal,
}

impl BalanceMutation {
    /// 由支付事件计算目标账户与变动金额
    ///
    /// 卡支付作用于 `card_id` 对应的卡账户，其他支付作用于客户账户；
    /// 创建事件扣款，取消事件回冲。
    pub fn from_event(event: &PaymentEvent) -> Result<Self> {
        if event.amount <= Decimal::ZERO {
            return Err(ReconcileError::InvalidEvent(format!(
                "金额必须为正数: payment_id={}, amount={}",
                event.payment_id, event.amount
            )));
        }

        let (account_kind, account_id) = match event.payment_type {
            PaymentType::Card => match event.card_id {
                Some(card_id) if card_id != 0 => (AccountKind::Card, card_id),
                _ => {
                    return Err(ReconcileError::InvalidEvent(format!(
                        "卡支付缺少 card_id: payment_id={}",
                        event.payment_id
                    )));
                }
            },
            PaymentType::Cash => (AccountKind::Customer, event.customer_id),
        };

        let delta = match event.event_type {
            PaymentEventType::Created => -event.amount,
            PaymentEventType::Cancelled => event.amount,
        };

        Ok(Self {
            payment_id: event.payment_id,
            event_type: event.event_type,
            account_kind,
            account_id,
            delta,
        })
    }

    /// 在给定策略下，落账前是否要求同一支付的创建扣款已落账
    pub fn requires_prior_debit(&self, policy: ReversalPolicy) -> bool {
        policy == ReversalPolicy::RequireAppliedDebit
            && self.event_type == PaymentEventType::Cancelled
    }
}

/// 落账结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// 已存在相同 (payment_id, event_type) 的记录，重复投递被吸收
    Duplicate,
    /// 取消事件没有对应的已落账扣款，按策略跳过
    SkippedNoPriorDebit,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::SkippedNoPriorDebit => "skipped",
        }
    }
}

/// 账户存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// 原子地写入去重记录并调整余额
    ///
    /// 账户不存在时不留下任何痕迹并返回 `AccountNotFound`，
    /// 重新投递时可以再次尝试。
    async fn apply_once(
        &self,
        mutation: &BalanceMutation,
        policy: ReversalPolicy,
    ) -> Result<ApplyOutcome>;

    async fn balance(&self, kind: AccountKind, account_id: i64) -> Result<Option<Decimal>>;

    /// 删除早于 `cutoff` 的去重记录，返回删除条数
    async fn purge_applied_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
