//! 死信队列
//!
//! 重新投递次数耗尽或不可重试的消息被包装成 [`DeadLetterMessage`] 写入
//! `payments.dlq`，分区进度随后越过该消息，避免一条毒消息卡住整个分区。
//! 死信消息保留原始负载与来源位置，供人工排查后重放。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::kafka::{ConsumerMessage, DeadLetterSink, KafkaProducer, topics};

/// 死信消息信封
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息标识（key@partition:offset）
    pub message_id: String,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    pub key: Option<String>,
    /// 原始负载；非 UTF-8 字节以替换字符保存
    pub payload: String,
    /// 最后一次失败的原因
    pub error: String,
    /// 进入死信前经历的重新投递次数
    pub redeliveries: u32,
    pub failed_at: DateTime<Utc>,
    pub source_service: String,
}

impl DeadLetterMessage {
    pub fn from_message(
        message: &ConsumerMessage,
        error: impl Into<String>,
        redeliveries: u32,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message.message_id(),
            source_topic: message.topic.clone(),
            source_partition: message.partition,
            source_offset: message.offset,
            key: message.key.clone(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            error: error.into(),
            redeliveries,
            failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }
}

/// DLQ 生产者
///
/// 独占一个 [`KafkaProducer`]，服务退出时通过 [`DlqProducer::close`] 刷新并释放。
pub struct DlqProducer {
    producer: KafkaProducer,
    source_service: String,
}

impl DlqProducer {
    pub fn new(producer: KafkaProducer, source_service: &str) -> Self {
        Self {
            producer,
            source_service: source_service.to_string(),
        }
    }

    pub fn close(self) -> Result<()> {
        self.producer.close()
    }
}

#[async_trait]
impl DeadLetterSink for DlqProducer {
    async fn send(&self, message: &ConsumerMessage, error: &str, redeliveries: u32) -> Result<()> {
        let dead_letter =
            DeadLetterMessage::from_message(message, error, redeliveries, &self.source_service);

        // 保持原始 key，使同一支付的死信落在同一分区
        let key = message.key.clone().unwrap_or_else(|| dead_letter.message_id.clone());
        self.producer
            .send_json(topics::DEAD_LETTER, &key, &dead_letter)
            .await?;

        warn!(
            message_id = %dead_letter.message_id,
            source_topic = %dead_letter.source_topic,
            redeliveries,
            error,
            "消息已发送到死信队列"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_dead_letter_keeps_source_position() {
        let message = ConsumerMessage {
            topic: topics::PAYMENTS.to_string(),
            partition: 3,
            offset: 120,
            key: Some("42".to_string()),
            payload: vec![b'{', 0xFF, b'}'],
            timestamp: None,
            headers: HashMap::new(),
        };

        let dead_letter =
            DeadLetterMessage::from_message(&message, "account not found", 5, "balance-reconciler");

        assert_eq!(dead_letter.message_id, "42@3:120");
        assert_eq!(dead_letter.source_partition, 3);
        assert_eq!(dead_letter.source_offset, 120);
        assert_eq!(dead_letter.redeliveries, 5);
        assert_eq!(dead_letter.payload, "{\u{FFFD}}");

        let json = serde_json::to_value(&dead_letter).unwrap();
        assert_eq!(json["sourceTopic"], "payments");
        assert_eq!(json["sourceService"], "balance-reconciler");
    }
}
