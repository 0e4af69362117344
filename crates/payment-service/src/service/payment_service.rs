//! 支付生命周期服务
//!
//! 每次状态变更都会产生一条支付生命周期事件：
//!
//! - 尽力发送模式：先持久化支付记录，再直接发布事件。发布失败只记录日志，
//!   调用方依然得到成功结果，持久化的支付记录才是资金事实。
//! - outbox 模式：支付记录与事件在同一事务内写入，由 [`crate::OutboxRelay`] 异步发布。
//!
//! ## 取消流程
//!
//! 1. 查询支付记录 -> 2. 状态检查（仅 PENDING / PROCESSING 可取消）
//! -> 3. 带状态条件写入状态与原因 -> 4. 发出取消事件
//!
//! 第 2 步只是快速失败，真正的判定在第 3 步：并发的取消或完成只有一个能写入，
//! 落败的一方返回 `InvalidState`，不会发出事件。

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use payment_shared::config::EventDelivery;
use payment_shared::events::{PaymentEventType, PaymentStatus};
use payment_shared::kafka::{EventPublisher, topics};

use crate::error::{PaymentServiceError, Result};
use crate::models::{CreatePaymentRequest, Payment, PaymentFilter};
use crate::repository::PaymentRepositoryTrait;

pub struct PaymentService<R = crate::repository::PaymentRepository>
where
    R: PaymentRepositoryTrait,
{
    repo: Arc<R>,
    publisher: Arc<dyn EventPublisher>,
    delivery: EventDelivery,
}

impl<R> PaymentService<R>
where
    R: PaymentRepositoryTrait,
{
    pub fn new(repo: Arc<R>, publisher: Arc<dyn EventPublisher>, delivery: EventDelivery) -> Self {
        Self {
            repo,
            publisher,
            delivery,
        }
    }

    pub fn delivery(&self) -> EventDelivery {
        self.delivery
    }

    /// 创建支付
    ///
    /// 校验失败直接返回 `Validation`；记录以 PENDING 状态落库后发出 CREATED 事件。
    #[instrument(skip(self, request), fields(customer_id = request.customer_id, payment_type = %request.payment_type))]
    pub async fn create_payment(&self, request: CreatePaymentRequest) -> Result<Payment> {
        let new_payment = request.validate()?;

        let payment = match self.delivery {
            EventDelivery::BestEffort => {
                let payment = self.repo.create(&new_payment).await?;
                self.publish_best_effort(&payment, PaymentEventType::Created)
                    .await;
                payment
            }
            EventDelivery::Outbox => {
                self.repo
                    .create_with_outbox(&new_payment, PaymentEventType::Created)
                    .await?
            }
        };

        info!(
            payment_id = payment.id,
            amount = %payment.amount,
            "支付已创建"
        );
        Ok(payment)
    }

    /// 取消支付
    ///
    /// 仅 PENDING / PROCESSING 状态允许取消，取消原因写入 description。
    #[instrument(skip(self))]
    pub async fn cancel_payment(&self, payment_id: i64, reason: &str) -> Result<Payment> {
        let current = self
            .repo
            .get_by_id(payment_id)
            .await?
            .ok_or(PaymentServiceError::NotFound(payment_id))?;

        if !current.status.is_cancellable() {
            return Err(PaymentServiceError::InvalidState {
                payment_id,
                status: current.status,
            });
        }

        let cancelled = Payment {
            status: PaymentStatus::Cancelled,
            description: Some(format!("Cancelled: {reason}")),
            updated_at: Utc::now(),
            ..current
        };

        let updated = match self.delivery {
            EventDelivery::BestEffort => {
                self.repo
                    .transition(&cancelled, &PaymentStatus::CANCELLABLE)
                    .await?
            }
            EventDelivery::Outbox => {
                self.repo
                    .transition_with_outbox(
                        &cancelled,
                        &PaymentStatus::CANCELLABLE,
                        PaymentEventType::Cancelled,
                    )
                    .await?
            }
        };

        let Some(payment) = updated else {
            return Err(self.lost_transition(payment_id).await);
        };

        if self.delivery == EventDelivery::BestEffort {
            self.publish_best_effort(&payment, PaymentEventType::Cancelled)
                .await;
        }

        info!(payment_id, reason, "支付已取消");
        Ok(payment)
    }

    pub async fn get_payment(&self, payment_id: i64) -> Result<Payment> {
        self.repo
            .get_by_id(payment_id)
            .await?
            .ok_or(PaymentServiceError::NotFound(payment_id))
    }

    /// 按客户查询支付记录，可按状态与创建时间区间过滤
    pub async fn list_payments(&self, filter: &PaymentFilter) -> Result<Vec<Payment>> {
        if filter.customer_id == 0 {
            return Err(PaymentServiceError::Validation(
                "customer_id 不能为空".to_string(),
            ));
        }
        if let (Some(from), Some(to)) = (filter.from, filter.to)
            && from > to
        {
            return Err(PaymentServiceError::Validation(format!(
                "时间区间无效: from={from} 晚于 to={to}"
            )));
        }

        self.repo.list(filter).await
    }

    /// 状态在检查之后被其他写入者改变，按最新状态报告
    async fn lost_transition(&self, payment_id: i64) -> PaymentServiceError {
        match self.repo.get_by_id(payment_id).await {
            Ok(Some(latest)) => {
                warn!(payment_id, status = %latest.status, "取消与并发的状态变更冲突");
                PaymentServiceError::InvalidState {
                    payment_id,
                    status: latest.status,
                }
            }
            Ok(None) => PaymentServiceError::NotFound(payment_id),
            Err(e) => e,
        }
    }

    /// 发布失败不影响已经落库的状态变更
    async fn publish_best_effort(&self, payment: &Payment, event_type: PaymentEventType) {
        let event = payment.to_event(event_type);
        if let Err(e) = self.publisher.publish(topics::PAYMENTS, &event).await {
            warn!(
                payment_id = payment.id,
                event_type = %event_type,
                event_id = %event.event_id,
                error = %e,
                "支付事件发布失败，支付记录已持久化"
            );
        }
    }
}
