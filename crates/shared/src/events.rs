//! 支付事件模型
//!
//! 定义写入 `payments` topic 的支付生命周期事件。事件类型是封闭枚举，
//! 消费端通过穷尽匹配分发；线上遇到的未知事件类型在解码阶段即被识别为
//! [`DecodedEvent::Unknown`]，由消费者记录日志后丢弃。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PaymentError;

/// 当前事件 schema 版本，字段只增不改
pub const SCHEMA_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// 枚举
// ---------------------------------------------------------------------------

/// 支付事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
pub enum PaymentEventType {
    #[serde(rename = "PAYMENT_CREATED")]
    #[sqlx(rename = "PAYMENT_CREATED")]
    Created,
    #[serde(rename = "PAYMENT_CANCELLED")]
    #[sqlx(rename = "PAYMENT_CANCELLED")]
    Cancelled,
}

impl PaymentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "PAYMENT_CREATED",
            Self::Cancelled => "PAYMENT_CANCELLED",
        }
    }

    /// 识别线上出现的事件类型字符串，未知类型返回 None
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PAYMENT_CREATED" => Some(Self::Created),
            "PAYMENT_CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 支付方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    Card,
    Cash,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "CARD",
            Self::Cash => "CASH",
        }
    }
}

impl FromStr for PaymentType {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CARD" => Ok(Self::Card),
            "CASH" => Ok(Self::Cash),
            other => Err(PaymentError::Validation(format!("无效的支付方式: {other}"))),
        }
    }
}

impl fmt::Display for PaymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 支付状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    /// 允许发起取消的状态
    pub const CANCELLABLE: [PaymentStatus; 2] = [Self::Pending, Self::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// 只有尚未完结的支付可以取消
    pub fn is_cancellable(&self) -> bool {
        Self::CANCELLABLE.contains(self)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 余额变动的目标账户类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountKind {
    Card,
    Customer,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "CARD",
            Self::Customer => "CUSTOMER",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PaymentEvent
// ---------------------------------------------------------------------------

/// 支付生命周期事件
///
/// 发布后不可变。Kafka 消息 key 固定为 `payment_id`，保证同一支付的
/// 创建与取消事件落在同一分区，从而保持先创建后取消的顺序。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    /// UUID v7，便于排查时按时间排序
    pub event_id: Uuid,
    pub event_type: PaymentEventType,
    pub payment_id: i64,
    pub customer_id: i64,
    /// 现金支付时为空
    #[serde(default)]
    pub card_id: Option<i64>,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    /// 事件发出时支付记录的状态
    pub status: PaymentStatus,
    #[serde(default)]
    pub description: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

fn default_schema_version() -> u16 {
    SCHEMA_VERSION
}

impl PaymentEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_type: PaymentEventType,
        payment_id: i64,
        customer_id: i64,
        card_id: Option<i64>,
        amount: Decimal,
        payment_type: PaymentType,
        status: PaymentStatus,
        description: Option<String>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            event_id: Uuid::now_v7(),
            event_type,
            payment_id,
            customer_id,
            card_id,
            amount,
            payment_type,
            status,
            description,
            occurred_at: Utc::now(),
        }
    }

    /// 分区 key：同一支付的所有事件必须进入同一分区
    pub fn partition_key(&self) -> String {
        self.payment_id.to_string()
    }

    pub fn encode(&self) -> Result<Vec<u8>, PaymentError> {
        serde_json::to_vec(self).map_err(|e| PaymentError::Serialization(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// 解码
// ---------------------------------------------------------------------------

/// 解码结果
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Known(PaymentEvent),
    /// 当前版本不认识的事件类型，按约定忽略
    Unknown { event_type: String },
}

/// 只读取事件类型的轻量头部，未知字段一律忽略
#[derive(Deserialize)]
struct EventHeader {
    event_type: Option<String>,
}

/// 两阶段解码：先读事件类型，再按已知类型解析完整结构
///
/// - 负载不是 JSON 对象或缺少 `event_type`：反序列化错误
/// - 事件类型未知：`DecodedEvent::Unknown`，不是错误
/// - 事件类型已知但字段不合法：反序列化错误
pub fn decode_event(payload: &[u8]) -> Result<DecodedEvent, PaymentError> {
    let header: EventHeader = serde_json::from_slice(payload)
        .map_err(|e| PaymentError::Deserialization(format!("事件头解析失败: {e}")))?;

    let Some(event_type) = header.event_type else {
        return Err(PaymentError::Deserialization(
            "事件缺少 event_type 字段".to_string(),
        ));
    };

    if PaymentEventType::parse(&event_type).is_none() {
        return Ok(DecodedEvent::Unknown { event_type });
    }

    let event: PaymentEvent = serde_json::from_slice(payload)
        .map_err(|e| PaymentError::Deserialization(format!("事件体解析失败: {e}")))?;

    if event.amount <= Decimal::ZERO {
        return Err(PaymentError::Deserialization(format!(
            "事件金额必须为正数: {}",
            event.amount
        )));
    }

    Ok(DecodedEvent::Known(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn card_event() -> PaymentEvent {
        PaymentEvent::new(
            PaymentEventType::Created,
            11,
            1,
            Some(7),
            dec!(50.00),
            PaymentType::Card,
            PaymentStatus::Pending,
            None,
        )
    }

    #[test]
    fn test_wire_format_uses_field_names() {
        let value: serde_json::Value = serde_json::to_value(card_event()).unwrap();

        assert_eq!(value["event_type"], "PAYMENT_CREATED");
        assert_eq!(value["payment_id"], 11);
        assert_eq!(value["card_id"], 7);
        assert_eq!(value["payment_type"], "CARD");
        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["schema_version"], 1);
    }

    #[test]
    fn test_decode_known_event() {
        let event = card_event();
        let payload = event.encode().unwrap();

        match decode_event(&payload).unwrap() {
            DecodedEvent::Known(decoded) => assert_eq!(decoded, event),
            other => panic!("expected known event, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_event_type_is_not_an_error() {
        let payload = br#"{"event_type":"PAYMENT_REFUNDED","payment_id":1}"#;

        assert_eq!(
            decode_event(payload).unwrap(),
            DecodedEvent::Unknown {
                event_type: "PAYMENT_REFUNDED".to_string()
            }
        );
    }

    #[test]
    fn test_decode_ignores_unknown_fields_and_accepts_numeric_amount() {
        let payload = br#"{
            "event_id": "0190a7d2-3c1e-7b4a-8f00-000000000001",
            "event_type": "PAYMENT_CANCELLED",
            "payment_id": 5,
            "customer_id": 2,
            "card_id": null,
            "amount": 12.5,
            "payment_type": "CASH",
            "status": "CANCELLED",
            "occurred_at": "2026-01-01T00:00:00Z",
            "cancelled_by": "ops"
        }"#;

        let DecodedEvent::Known(event) = decode_event(payload).unwrap() else {
            panic!("expected known event");
        };
        assert_eq!(event.schema_version, SCHEMA_VERSION);
        assert_eq!(event.amount, dec!(12.5));
        assert_eq!(event.card_id, None);
        assert_eq!(event.payment_type, PaymentType::Cash);
    }

    #[test]
    fn test_decode_malformed_payloads() {
        assert!(matches!(
            decode_event(b"not json"),
            Err(PaymentError::Deserialization(_))
        ));
        assert!(matches!(
            decode_event(br#"{"payment_id":1}"#),
            Err(PaymentError::Deserialization(_))
        ));
        // 已知类型但缺少必填字段
        assert!(matches!(
            decode_event(br#"{"event_type":"PAYMENT_CREATED","payment_id":1}"#),
            Err(PaymentError::Deserialization(_))
        ));
    }

    #[test]
    fn test_decode_rejects_non_positive_amount() {
        let mut event = card_event();
        event.amount = dec!(0);
        let payload = event.encode().unwrap();

        assert!(matches!(
            decode_event(&payload),
            Err(PaymentError::Deserialization(_))
        ));
    }

    #[test]
    fn test_payment_type_parse() {
        assert_eq!("CARD".parse::<PaymentType>().unwrap(), PaymentType::Card);
        assert!(matches!(
            "CRYPTO".parse::<PaymentType>(),
            Err(PaymentError::Validation(_))
        ));
    }

    #[test]
    fn test_cancellable_statuses() {
        assert!(PaymentStatus::Pending.is_cancellable());
        assert!(PaymentStatus::Processing.is_cancellable());
        assert!(!PaymentStatus::Completed.is_cancellable());
        assert!(!PaymentStatus::Failed.is_cancellable());
        assert!(!PaymentStatus::Cancelled.is_cancellable());
    }
}
