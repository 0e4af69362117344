//! Kafka 基础设施封装
//!
//! - [`connector`]：启动阶段带重试的 broker 连接
//! - [`producer`]：acks=all 的事件生产者与 [`EventPublisher`] 抽象
//! - [`consumer`]：按分区并发、可插拔进度跟踪的事件消费者

pub mod connector;
pub mod consumer;
pub mod producer;

use std::collections::HashMap;

use rdkafka::message::{BorrowedMessage, Headers, Message};

pub use connector::{BrokerClient, ClientRole, connect};
pub use consumer::{
    DeadLetterSink, DeliveryTracking, DispatchContext, EventHandler, HandlerError,
    PartitionControl, PartitionState, PartitionUnit, PartitionedConsumer, StartOffset, supervise,
};
pub use producer::{EventPublisher, KafkaProducer};

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

pub mod topics {
    /// 支付生命周期事件
    pub const PAYMENTS: &str = "payments";
    /// 重投递次数耗尽或不可重试的消息
    pub const DEAD_LETTER: &str = "payments.dlq";
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    pub(crate) fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for header in h.iter() {
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }

    /// 用于日志与死信记录的消息标识
    pub fn message_id(&self) -> String {
        match &self.key {
            Some(key) => format!("{key}@{}:{}", self.partition, self.offset),
            None => format!("{}:{}", self.partition, self.offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: Option<&str>, payload: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            topic: topics::PAYMENTS.to_string(),
            partition: 2,
            offset: 42,
            key: key.map(String::from),
            payload: payload.to_vec(),
            timestamp: Some(1_700_000_000_000),
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_topic_constants() {
        assert_eq!(topics::PAYMENTS, "payments");
        assert_eq!(topics::DEAD_LETTER, "payments.dlq");
    }

    #[test]
    fn test_message_id_includes_key_when_present() {
        assert_eq!(message(Some("11"), b"{}").message_id(), "11@2:42");
        assert_eq!(message(None, b"{}").message_id(), "2:42");
    }
}
