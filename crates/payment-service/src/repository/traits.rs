//! 仓储 Trait 定义

use async_trait::async_trait;

use payment_shared::events::{PaymentEventType, PaymentStatus};

use crate::error::Result;
use crate::models::{NewPayment, OutboxEntry, Payment, PaymentFilter};

/// 支付记录仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentRepositoryTrait: Send + Sync {
    async fn create(&self, payment: &NewPayment) -> Result<Payment>;
    async fn get_by_id(&self, id: i64) -> Result<Option<Payment>>;

    /// 状态迁移：仅当库中当前状态属于 `from` 时写入 `payment` 的状态与描述
    ///
    /// 返回写入后的记录；状态已被其他写入者改变时返回 `None`，不做任何修改。
    async fn transition(&self, payment: &Payment, from: &[PaymentStatus])
    -> Result<Option<Payment>>;

    async fn list(&self, filter: &PaymentFilter) -> Result<Vec<Payment>>;

    /// 插入支付记录，并在同一事务内写入对应的 outbox 事件
    async fn create_with_outbox(
        &self,
        payment: &NewPayment,
        event_type: PaymentEventType,
    ) -> Result<Payment>;

    /// 同 [`Self::transition`]，迁移成功时在同一事务内写入对应的 outbox 事件
    async fn transition_with_outbox(
        &self,
        payment: &Payment,
        from: &[PaymentStatus],
        event_type: PaymentEventType,
    ) -> Result<Option<Payment>>;
}

/// outbox 读写接口，供中继使用
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// 按 id 升序取出未发送的事件
    ///
    /// 尝试次数达到 `max_attempts` 的条目被搁置，同一支付在其之后的事件也一并搁置，
    /// 以免后发生的事件越过先发生的事件。
    async fn fetch_unpublished(&self, limit: i64, max_attempts: i32) -> Result<Vec<OutboxEntry>>;

    async fn mark_published(&self, id: i64) -> Result<()>;

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()>;
}
