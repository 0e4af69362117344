//! outbox 中继
//!
//! 周期性地按 id 升序取出未发送的事件并发布到 Kafka。
//! 任一事件发布失败即结束本批次：同一支付的后续事件不会越过失败的事件，
//! 下一轮从失败处重新开始。尝试次数达到上限的条目被搁置，等待人工处理。
//!
//! 投递语义为至少一次：发布成功但标记失败时，该事件会在下一轮重复发送，
//! 由下游对账服务的去重机制吸收。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use payment_shared::config::PaymentConfig;
use payment_shared::events::PaymentEvent;
use payment_shared::kafka::{EventPublisher, topics};
use payment_shared::observability::metrics::record_outbox_relay;

use crate::error::Result;
use crate::models::OutboxEntry;
use crate::repository::OutboxStore;

pub struct OutboxRelay<S: OutboxStore> {
    store: Arc<S>,
    publisher: Arc<dyn EventPublisher>,
    poll_interval: Duration,
    batch_size: i64,
    max_attempts: i32,
}

impl<S: OutboxStore> OutboxRelay<S> {
    pub fn new(store: Arc<S>, publisher: Arc<dyn EventPublisher>, config: &PaymentConfig) -> Self {
        Self {
            store,
            publisher,
            poll_interval: Duration::from_millis(config.outbox_poll_interval_ms),
            batch_size: config.outbox_batch_size,
            max_attempts: config.outbox_max_attempts,
        }
    }

    /// 运行直到收到关闭信号
    ///
    /// 正在发送的批次会先完成，关闭信号只在两轮之间生效。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            topic = topics::PAYMENTS,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "outbox 中继已启动"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                // 本批次全部成功且已满，说明还有积压，立即继续
                Ok(published) if published as i64 >= self.batch_size => continue,
                Ok(_) => {}
                Err(e) => error!(error = %e, "outbox 中继轮询失败"),
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("outbox 中继已停止");
    }

    /// 发送一批事件，返回成功发送的条数
    pub async fn tick(&self) -> Result<usize> {
        let batch = self
            .store
            .fetch_unpublished(self.batch_size, self.max_attempts)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }

        debug!(count = batch.len(), "取出待发送的 outbox 事件");

        let mut published = 0;
        for entry in batch {
            match self.publish_entry(&entry).await {
                Ok(()) => {
                    self.store.mark_published(entry.id).await?;
                    record_outbox_relay(true);
                    published += 1;
                }
                Err(reason) => {
                    record_outbox_relay(false);
                    self.store.mark_failed(entry.id, &reason).await?;

                    let attempts = entry.attempts + 1;
                    if attempts >= self.max_attempts {
                        error!(
                            outbox_id = entry.id,
                            payment_id = entry.payment_id,
                            event_type = %entry.event_type,
                            attempt = attempts,
                            error = %reason,
                            "outbox 事件达到最大尝试次数，已搁置"
                        );
                    } else {
                        warn!(
                            outbox_id = entry.id,
                            payment_id = entry.payment_id,
                            event_type = %entry.event_type,
                            attempt = attempts,
                            error = %reason,
                            "outbox 事件发送失败，结束本批次"
                        );
                    }
                    break;
                }
            }
        }

        Ok(published)
    }

    async fn publish_entry(&self, entry: &OutboxEntry) -> std::result::Result<(), String> {
        let event: PaymentEvent = serde_json::from_value(entry.payload.clone())
            .map_err(|e| format!("outbox 负载无法解析: {e}"))?;

        self.publisher
            .publish(topics::PAYMENTS, &event)
            .await
            .map_err(|e| e.to_string())
    }
}
