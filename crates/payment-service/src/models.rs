//! 支付领域模型

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use payment_shared::events::{PaymentEvent, PaymentEventType, PaymentStatus, PaymentType};

use crate::error::{PaymentServiceError, Result};

/// 支付记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i64,
    pub customer_id: i64,
    /// 现金支付为空
    pub card_id: Option<i64>,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// 以当前记录状态构造生命周期事件
    pub fn to_event(&self, event_type: PaymentEventType) -> PaymentEvent {
        PaymentEvent::new(
            event_type,
            self.id,
            self.customer_id,
            self.card_id,
            self.amount,
            self.payment_type,
            self.status,
            self.description.clone(),
        )
    }
}

/// 待插入的支付记录（id 与时间戳由存储分配）
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub customer_id: i64,
    pub card_id: Option<i64>,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    pub description: Option<String>,
}

/// 创建支付请求
///
/// `payment_type` 保留调用方传入的原始字符串，校验时才解析。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    pub customer_id: i64,
    #[serde(default)]
    pub card_id: Option<i64>,
    pub amount: Decimal,
    pub payment_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl CreatePaymentRequest {
    /// 校验请求并生成状态为 PENDING 的待插入记录
    pub fn validate(&self) -> Result<NewPayment> {
        let payment_type: PaymentType = self
            .payment_type
            .parse()
            .map_err(|_| PaymentServiceError::Validation(format!("无效的支付方式: {}", self.payment_type)))?;

        if self.customer_id == 0 {
            return Err(PaymentServiceError::Validation("customer_id 不能为空".to_string()));
        }

        if self.amount <= Decimal::ZERO {
            return Err(PaymentServiceError::Validation(format!(
                "支付金额必须为正数: {}",
                self.amount
            )));
        }

        let card_id = match payment_type {
            PaymentType::Card => match self.card_id {
                Some(id) if id != 0 => Some(id),
                _ => {
                    return Err(PaymentServiceError::Validation(
                        "卡支付必须指定 card_id".to_string(),
                    ));
                }
            },
            // 现金支付不涉及卡账户
            PaymentType::Cash => None,
        };

        Ok(NewPayment {
            customer_id: self.customer_id,
            card_id,
            amount: self.amount,
            payment_type,
            status: PaymentStatus::Pending,
            description: self.description.clone(),
        })
    }
}

/// 支付列表查询条件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaymentFilter {
    pub customer_id: i64,
    pub status: Option<PaymentStatus>,
    /// 创建时间下界（含）
    pub from: Option<DateTime<Utc>>,
    /// 创建时间上界（含）
    pub to: Option<DateTime<Utc>>,
}

impl PaymentFilter {
    pub fn for_customer(customer_id: i64) -> Self {
        Self {
            customer_id,
            ..Default::default()
        }
    }

    pub fn matches(&self, payment: &Payment) -> bool {
        payment.customer_id == self.customer_id
            && self.status.is_none_or(|s| payment.status == s)
            && self.from.is_none_or(|from| payment.created_at >= from)
            && self.to.is_none_or(|to| payment.created_at <= to)
    }
}

/// outbox 中待发送的事件
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct OutboxEntry {
    pub id: i64,
    pub payment_id: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(payment_type: &str, card_id: Option<i64>, amount: Decimal) -> CreatePaymentRequest {
        CreatePaymentRequest {
            customer_id: 1,
            card_id,
            amount,
            payment_type: payment_type.to_string(),
            description: Some("coffee".to_string()),
        }
    }

    #[test]
    fn test_validate_card_payment() {
        let new_payment = request("CARD", Some(7), dec!(50.00)).validate().unwrap();
        assert_eq!(new_payment.payment_type, PaymentType::Card);
        assert_eq!(new_payment.card_id, Some(7));
        assert_eq!(new_payment.status, PaymentStatus::Pending);
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let cases = [
            request("CRYPTO", None, dec!(10)),
            request("CARD", None, dec!(10)),
            request("CARD", Some(0), dec!(10)),
            request("CASH", None, dec!(0)),
            request("CASH", None, dec!(-5)),
        ];
        for case in cases {
            assert!(
                matches!(case.validate(), Err(PaymentServiceError::Validation(_))),
                "expected validation error for {case:?}"
            );
        }
    }

    #[test]
    fn test_cash_payment_drops_card() {
        let new_payment = request("CASH", Some(7), dec!(10)).validate().unwrap();
        assert_eq!(new_payment.card_id, None);
    }

    #[test]
    fn test_filter_matches_range_and_status() {
        let now = Utc::now();
        let payment = Payment {
            id: 1,
            customer_id: 1,
            card_id: None,
            amount: dec!(10),
            payment_type: PaymentType::Cash,
            status: PaymentStatus::Pending,
            description: None,
            created_at: now,
            updated_at: now,
        };

        assert!(PaymentFilter::for_customer(1).matches(&payment));
        assert!(!PaymentFilter::for_customer(2).matches(&payment));

        let filter = PaymentFilter {
            status: Some(PaymentStatus::Cancelled),
            ..PaymentFilter::for_customer(1)
        };
        assert!(!filter.matches(&payment));

        let filter = PaymentFilter {
            from: Some(now - chrono::Duration::hours(1)),
            to: Some(now),
            ..PaymentFilter::for_customer(1)
        };
        assert!(filter.matches(&payment));
    }
}
