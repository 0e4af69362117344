//! 内存仓储
//!
//! 使用 DashMap 保存支付记录、Mutex 保护 outbox 队列，
//! 用于测试和无数据库的本地开发。

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use payment_shared::events::{PaymentEventType, PaymentStatus};

use super::traits::{OutboxStore, PaymentRepositoryTrait};
use crate::error::Result;
use crate::models::{NewPayment, OutboxEntry, Payment, PaymentFilter};

#[derive(Debug, Clone)]
struct StoredOutboxEntry {
    entry: OutboxEntry,
    published: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryPaymentRepository {
    payments: DashMap<i64, Payment>,
    next_payment_id: AtomicI64,
    outbox: Mutex<Vec<StoredOutboxEntry>>,
}

impl InMemoryPaymentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有 outbox 条目（含已发送），按 id 升序
    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.outbox.lock().iter().map(|s| s.entry.clone()).collect()
    }

    pub fn published_ids(&self) -> Vec<i64> {
        self.outbox
            .lock()
            .iter()
            .filter(|s| s.published)
            .map(|s| s.entry.id)
            .collect()
    }

    fn insert(&self, payment: &NewPayment) -> Payment {
        let now = Utc::now();
        let created = Payment {
            id: self.next_payment_id.fetch_add(1, Ordering::SeqCst) + 1,
            customer_id: payment.customer_id,
            card_id: payment.card_id,
            amount: payment.amount,
            payment_type: payment.payment_type,
            status: payment.status,
            description: payment.description.clone(),
            created_at: now,
            updated_at: now,
        };
        self.payments.insert(created.id, created.clone());
        created
    }

    /// 在记录的分片锁内比较并写入，等同于带状态条件的 UPDATE
    fn compare_and_set(&self, payment: &Payment, from: &[PaymentStatus]) -> Option<Payment> {
        let mut stored = self.payments.get_mut(&payment.id)?;
        if !from.contains(&stored.status) {
            return None;
        }
        stored.status = payment.status;
        stored.description = payment.description.clone();
        stored.updated_at = Utc::now();
        Some(stored.value().clone())
    }

    fn enqueue(outbox: &mut Vec<StoredOutboxEntry>, payment: &Payment, event_type: PaymentEventType) -> Result<()> {
        let payload = serde_json::to_value(payment.to_event(event_type))?;
        let id = outbox.len() as i64 + 1;
        outbox.push(StoredOutboxEntry {
            entry: OutboxEntry {
                id,
                payment_id: payment.id,
                event_type: event_type.as_str().to_string(),
                payload,
                attempts: 0,
                last_error: None,
                created_at: Utc::now(),
            },
            published: false,
        });
        Ok(())
    }
}

#[async_trait]
impl PaymentRepositoryTrait for InMemoryPaymentRepository {
    async fn create(&self, payment: &NewPayment) -> Result<Payment> {
        Ok(self.insert(payment))
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Payment>> {
        Ok(self.payments.get(&id).map(|p| p.value().clone()))
    }

    async fn transition(
        &self,
        payment: &Payment,
        from: &[PaymentStatus],
    ) -> Result<Option<Payment>> {
        Ok(self.compare_and_set(payment, from))
    }

    async fn list(&self, filter: &PaymentFilter) -> Result<Vec<Payment>> {
        let mut payments: Vec<Payment> = self
            .payments
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(payments)
    }

    async fn create_with_outbox(
        &self,
        payment: &NewPayment,
        event_type: PaymentEventType,
    ) -> Result<Payment> {
        // 持有 outbox 锁完成两步写入，效果等同于同一事务
        let mut outbox = self.outbox.lock();
        let created = self.insert(payment);
        Self::enqueue(&mut outbox, &created, event_type)?;
        Ok(created)
    }

    async fn transition_with_outbox(
        &self,
        payment: &Payment,
        from: &[PaymentStatus],
        event_type: PaymentEventType,
    ) -> Result<Option<Payment>> {
        let mut outbox = self.outbox.lock();
        let Some(updated) = self.compare_and_set(payment, from) else {
            return Ok(None);
        };
        Self::enqueue(&mut outbox, &updated, event_type)?;
        Ok(Some(updated))
    }
}

#[async_trait]
impl OutboxStore for InMemoryPaymentRepository {
    async fn fetch_unpublished(&self, limit: i64, max_attempts: i32) -> Result<Vec<OutboxEntry>> {
        let outbox = self.outbox.lock();

        let parked: Vec<(i64, i64)> = outbox
            .iter()
            .filter(|s| !s.published && s.entry.attempts >= max_attempts)
            .map(|s| (s.entry.payment_id, s.entry.id))
            .collect();

        Ok(outbox
            .iter()
            .filter(|s| !s.published && s.entry.attempts < max_attempts)
            .filter(|s| {
                !parked
                    .iter()
                    .any(|(payment_id, id)| *payment_id == s.entry.payment_id && *id < s.entry.id)
            })
            .take(limit.max(0) as usize)
            .map(|s| s.entry.clone())
            .collect())
    }

    async fn mark_published(&self, id: i64) -> Result<()> {
        if let Some(stored) = self.outbox.lock().iter_mut().find(|s| s.entry.id == id) {
            stored.published = true;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        if let Some(stored) = self.outbox.lock().iter_mut().find(|s| s.entry.id == id) {
            stored.entry.attempts += 1;
            stored.entry.last_error = Some(error.to_string());
        }
        Ok(())
    }
}
