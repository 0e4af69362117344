//! 事件生产者
//!
//! 所有事件以 `payment_id` 为 key 发送，同一支付的事件落在同一分区。
//! 生产者要求所有 ISR 副本确认（acks=all）并开启幂等发送，
//! 瞬时故障由 librdkafka 在内部有限次重试，超过后才向调用方返回错误。

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::connector::{BrokerClient, ClientRole};
use crate::config::KafkaConfig;
use crate::error::{PaymentError, Result};
use crate::events::PaymentEvent;
use crate::observability::metrics::record_event_published;

/// 支付事件发布抽象
///
/// 生命周期服务与 outbox 中继只依赖此 trait，测试时可替换为内存实现。
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, event: &PaymentEvent) -> Result<()>;
}

/// 面向业务的 Kafka 生产者
///
/// 不实现 Clone：句柄由创建它的组件独占，共享时包在 `Arc` 中，
/// 关闭时取回所有权调用 [`KafkaProducer::close`]。
pub struct KafkaProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("retries", config.producer_retries.to_string())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .map_err(|e| PaymentError::Kafka(format!("创建生产者失败: {e}")))?;

        debug!(brokers = %config.brokers, "Kafka 生产者客户端已创建");
        Ok(Self {
            producer,
            send_timeout: config.message_timeout(),
        })
    }

    /// 发送原始字节消息，返回 (partition, offset)
    pub async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(i32, i64)> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| PaymentError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64)> {
        let payload = serde_json::to_vec(value)?;
        self.send(topic, key, &payload).await
    }

    /// 刷新所有未完成的投递并释放客户端
    ///
    /// 接收 `self`，关闭后句柄不可再用。
    pub fn close(self) -> Result<()> {
        let result = self
            .producer
            .flush(self.send_timeout)
            .map_err(|e| PaymentError::Kafka(format!("关闭前刷新生产者失败: {e}")));

        match &result {
            Ok(()) => info!("Kafka 生产者已关闭"),
            Err(e) => warn!(error = %e, "Kafka 生产者关闭时仍有未投递的消息"),
        }
        result
    }
}

impl BrokerClient for KafkaProducer {
    const ROLE: ClientRole = ClientRole::Producer;

    fn create(config: &KafkaConfig) -> Result<Self> {
        Self::new(config)
    }

    fn probe(&self, timeout: Duration) -> Result<()> {
        self.producer
            .client()
            .fetch_metadata(None, timeout)
            .map(|_| ())
            .map_err(|e| PaymentError::Kafka(format!("获取集群元数据失败: {e}")))
    }
}

#[async_trait]
impl EventPublisher for KafkaProducer {
    async fn publish(&self, topic: &str, event: &PaymentEvent) -> Result<()> {
        let payload = event.encode()?;
        let key = event.partition_key();

        let result = self.send(topic, &key, &payload).await;
        record_event_published(event.event_type.as_str(), result.is_ok());

        let (partition, offset) = result?;
        info!(
            topic,
            partition,
            offset,
            payment_id = event.payment_id,
            event_type = %event.event_type,
            "支付事件已发布"
        );
        Ok(())
    }
}
