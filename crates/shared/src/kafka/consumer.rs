//! 分区事件消费者
//!
//! 启动时解析 topic 的分区集合，每个分区拆出独立的队列并由一个 tokio 任务
//! （分区消费单元）消费，分区之间互不共享，从而保持分区内的投递顺序。
//! 主队列只由协调循环轮询，用于驱动 broker 回调和输出客户端错误。
//!
//! 消费进度由 [`DeliveryTracking`] 决定：
//! - `ConsumerGroup`：从已提交 offset 继续，每条消息处理成功后才提交
//! - `Manual`：不提交 offset，每次从配置的起点开始
//!
//! 处理失败时不提交进度：等待退避后将分区回退到失败的 offset，由 broker 重新投递；
//! 超过重投递上限或遇到不可重试错误时写入死信 topic 并越过该消息。

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{CommitMode, Consumer, DefaultConsumerContext, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::ConsumerMessage;
use super::connector::{BrokerClient, ClientRole, PROBE_TIMEOUT};
use crate::config::{KafkaConfig, TrackingMode};
use crate::error::{PaymentError, Result};
use crate::events::{DecodedEvent, PaymentEvent, decode_event};
use crate::observability::metrics::record_event_consumed;
use crate::retry::RetryPolicy;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// 进度跟踪策略
// ---------------------------------------------------------------------------

/// 无已提交进度时的起始位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Earliest,
    Latest,
}

impl StartOffset {
    fn from_reset_policy(value: &str) -> Self {
        if value.eq_ignore_ascii_case("latest") {
            Self::Latest
        } else {
            Self::Earliest
        }
    }
}

/// 消费进度的跟踪策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryTracking {
    ConsumerGroup,
    Manual { start: StartOffset },
}

impl DeliveryTracking {
    pub fn from_config(config: &KafkaConfig) -> Self {
        match config.delivery_tracking {
            TrackingMode::ConsumerGroup => Self::ConsumerGroup,
            TrackingMode::Manual => Self::Manual {
                start: StartOffset::from_reset_policy(&config.auto_offset_reset),
            },
        }
    }

    fn initial_offset(&self) -> Offset {
        match self {
            // 没有已提交进度时由 auto.offset.reset 决定
            Self::ConsumerGroup => Offset::Stored,
            Self::Manual {
                start: StartOffset::Earliest,
            } => Offset::Beginning,
            Self::Manual {
                start: StartOffset::Latest,
            } => Offset::End,
        }
    }

    fn commits(&self) -> bool {
        matches!(self, Self::ConsumerGroup)
    }
}

// ---------------------------------------------------------------------------
// 分区状态
// ---------------------------------------------------------------------------

/// 分区消费单元的状态
///
/// `Idle → Consuming → (Draining | Errored) → Closed`，
/// `Errored` 在下一条消息处理成功后回到 `Consuming`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Idle,
    Consuming,
    Draining,
    Errored,
    Closed,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Consuming => "consuming",
            Self::Draining => "draining",
            Self::Errored => "errored",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// 处理器与死信出口
// ---------------------------------------------------------------------------

/// 事件处理失败
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    retryable: bool,
}

impl HandlerError {
    /// 可通过重新投递恢复的失败（如存储暂不可用）
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// 重试也无法成功的失败，消息直接进入死信 topic
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// 已解码支付事件的处理器
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &PaymentEvent) -> std::result::Result<(), HandlerError>;
}

/// 死信出口
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, message: &ConsumerMessage, error: &str, redeliveries: u32) -> Result<()>;
}

/// 单个分区的进度控制
pub trait PartitionControl: Send + Sync {
    /// 记录 `offset` 已处理完成
    fn commit(&self, offset: i64) -> Result<()>;

    /// 将分区读取位置回退到 `offset`
    fn seek(&self, offset: i64) -> Result<()>;
}

/// 各分区单元共享的分发依赖
#[derive(Clone)]
pub struct DispatchContext {
    pub handler: Arc<dyn EventHandler>,
    pub dead_letter: Arc<dyn DeadLetterSink>,
    pub redelivery: RetryPolicy,
}

// ---------------------------------------------------------------------------
// 分区消费单元
// ---------------------------------------------------------------------------

enum Next {
    Continue,
    RetryInPlace,
    Stop,
}

/// 一个分区的消费循环
///
/// 三路等待：下一条消息、分区错误、关闭信号。分区错误只记录日志，
/// 只有关闭信号（或消息流结束）会终止循环。
pub struct PartitionUnit<S, C> {
    topic: String,
    partition: i32,
    messages: S,
    control: C,
    ctx: DispatchContext,
    shutdown: watch::Receiver<bool>,
    state: PartitionState,
    /// 回退后等待重新投递的 offset；更小的 offset 被丢弃，更大的 offset 说明目标已不存在
    rewind_to: Option<i64>,
    /// (offset, 失败次数)
    failures: Option<(i64, u32)>,
}

impl<S, C> PartitionUnit<S, C>
where
    S: Stream<Item = Result<ConsumerMessage>> + Send + Unpin,
    C: PartitionControl,
{
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        messages: S,
        control: C,
        ctx: DispatchContext,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            messages,
            control,
            ctx,
            shutdown,
            state: PartitionState::Idle,
            rewind_to: None,
            failures: None,
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// 运行到关闭信号到达，返回最终状态
    pub async fn run(mut self) -> PartitionState {
        if !*self.shutdown.borrow() {
            self.transition(PartitionState::Consuming);
            self.consume().await;
        }

        self.transition(PartitionState::Draining);
        self.transition(PartitionState::Closed);
        self.state
    }

    async fn consume(&mut self) {
        loop {
            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!(topic = %self.topic, partition = self.partition, "收到关闭信号，停止拉取消息");
                        return;
                    }
                }

                next = self.messages.next() => {
                    match next {
                        None => {
                            warn!(topic = %self.topic, partition = self.partition, "分区消息流意外结束");
                            return;
                        }
                        Some(Err(e)) => {
                            error!(topic = %self.topic, partition = self.partition, error = %e, "分区接收消息出错");
                            self.transition(PartitionState::Errored);
                        }
                        Some(Ok(msg)) => {
                            if !self.on_message(msg).await {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// 返回 false 表示应停止消费
    async fn on_message(&mut self, msg: ConsumerMessage) -> bool {
        if let Some(target) = self.rewind_to {
            if msg.offset < target {
                debug!(
                    partition = self.partition,
                    offset = msg.offset,
                    target,
                    "丢弃回退目标之前的消息"
                );
                return true;
            }
            if msg.offset > target {
                // 目标 offset 已被保留策略清理，或越界 seek 被重置到了更后的位置
                warn!(
                    partition = self.partition,
                    offset = msg.offset,
                    target,
                    "回退目标不再可用，从当前消息继续消费"
                );
            }
            self.rewind_to = None;
        }

        loop {
            let failure = match dispatch(&self.ctx, &msg).await {
                Ok(()) => {
                    self.failures = None;
                    self.transition(PartitionState::Consuming);
                    self.commit(&msg);
                    return true;
                }
                Err(e) => e,
            };

            match self.on_failure(&msg, failure).await {
                Next::Continue => return true,
                Next::RetryInPlace => continue,
                Next::Stop => return false,
            }
        }
    }

    async fn on_failure(&mut self, msg: &ConsumerMessage, err: HandlerError) -> Next {
        record_event_consumed("failed");
        self.transition(PartitionState::Errored);

        let failures = match self.failures {
            Some((offset, count)) if offset == msg.offset => count + 1,
            _ => 1,
        };
        self.failures = Some((msg.offset, failures));
        let redeliveries = failures - 1;

        if err.is_retryable() && self.ctx.redelivery.should_retry(redeliveries) {
            let delay = self.ctx.redelivery.delay_for_attempt(redeliveries);
            warn!(
                partition = msg.partition,
                offset = msg.offset,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "事件处理失败，等待后重新投递"
            );

            if !self.backoff(delay).await {
                return Next::Stop;
            }

            return match self.control.seek(msg.offset) {
                Ok(()) => {
                    self.rewind_to = Some(msg.offset);
                    Next::Continue
                }
                Err(e) => {
                    warn!(partition = msg.partition, offset = msg.offset, error = %e, "回退分区位置失败，原地重试");
                    Next::RetryInPlace
                }
            };
        }

        match self
            .ctx
            .dead_letter
            .send(msg, &err.to_string(), redeliveries)
            .await
        {
            Ok(()) => {
                error!(
                    partition = msg.partition,
                    offset = msg.offset,
                    attempt = failures,
                    error = %err,
                    "消息已转入死信 topic"
                );
                record_event_consumed("dead_lettered");
                self.failures = None;
                self.commit(msg);
                Next::Continue
            }
            Err(e) => {
                error!(partition = msg.partition, offset = msg.offset, error = %e, "写入死信 topic 失败");
                if self.backoff(self.ctx.redelivery.max_delay).await {
                    Next::RetryInPlace
                } else {
                    Next::Stop
                }
            }
        }
    }

    /// 可被关闭信号打断的等待，被打断时返回 false
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!(partition = self.partition, "退避期间收到关闭信号，未提交的消息将在重启后重新投递");
                        return false;
                    }
                }

                _ = &mut sleep => return true,
            }
        }
    }

    fn commit(&self, msg: &ConsumerMessage) {
        if let Err(e) = self.control.commit(msg.offset) {
            warn!(partition = msg.partition, offset = msg.offset, error = %e, "提交 offset 失败");
        }
    }

    fn transition(&mut self, next: PartitionState) {
        if self.state != next {
            debug!(
                topic = %self.topic,
                partition = self.partition,
                from = %self.state,
                to = %next,
                "分区状态变更"
            );
            self.state = next;
        }
    }
}

/// 解码并分发一条消息；格式错误与未知类型记录后视为已处理
async fn dispatch(
    ctx: &DispatchContext,
    msg: &ConsumerMessage,
) -> std::result::Result<(), HandlerError> {
    match decode_event(&msg.payload) {
        Err(e) => {
            warn!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                error = %e,
                "消息格式错误，已跳过"
            );
            record_event_consumed("malformed");
            Ok(())
        }
        Ok(DecodedEvent::Unknown { event_type }) => {
            warn!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                event_type = %event_type,
                "未知事件类型，已丢弃"
            );
            record_event_consumed("unknown");
            Ok(())
        }
        Ok(DecodedEvent::Known(event)) => {
            debug!(
                partition = msg.partition,
                offset = msg.offset,
                payment_id = event.payment_id,
                event_type = %event.event_type,
                "分发支付事件"
            );
            ctx.handler.handle(&event).await
        }
    }
}

/// 并发运行所有分区单元，等待全部退出后返回各分区的最终状态
///
/// `background` 与单元并行轮询，完成后不再被轮询。
pub async fn supervise<S, C, F>(
    units: Vec<PartitionUnit<S, C>>,
    background: F,
) -> Vec<(i32, PartitionState)>
where
    S: Stream<Item = Result<ConsumerMessage>> + Send + Unpin + 'static,
    C: PartitionControl + 'static,
    F: Future<Output = ()>,
{
    let mut set = JoinSet::new();
    for unit in units {
        let partition = unit.partition();
        set.spawn(async move { (partition, unit.run().await) });
    }

    tokio::pin!(background);
    let mut background_done = false;
    let mut finished = Vec::new();

    loop {
        tokio::select! {
            joined = set.join_next() => match joined {
                None => break,
                Some(Ok(result)) => finished.push(result),
                Some(Err(e)) => error!(error = %e, "分区消费任务异常退出"),
            },
            _ = &mut background, if !background_done => {
                background_done = true;
            }
        }
    }

    finished.sort_by_key(|(partition, _)| *partition);
    finished
}

// ---------------------------------------------------------------------------
// rdkafka 实现
// ---------------------------------------------------------------------------

struct KafkaPartitionControl {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    commits: bool,
}

impl PartitionControl for KafkaPartitionControl {
    fn commit(&self, offset: i64) -> Result<()> {
        if !self.commits {
            return Ok(());
        }

        // 提交的是下一条待消费的位置
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, Offset::Offset(offset + 1))
            .map_err(|e| PaymentError::Kafka(format!("构造提交列表失败: {e}")))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| PaymentError::Kafka(format!("提交 offset 失败: {e}")))
    }

    fn seek(&self, offset: i64) -> Result<()> {
        self.consumer
            .seek(&self.topic, self.partition, Offset::Offset(offset), SEEK_TIMEOUT)
            .map_err(|e| PaymentError::Kafka(format!("回退分区位置失败: {e}")))
    }
}

type PartitionQueue = StreamPartitionQueue<DefaultConsumerContext>;

fn partition_stream(queue: PartitionQueue) -> BoxStream<'static, Result<ConsumerMessage>> {
    futures::stream::unfold(queue, |queue| async move {
        let next = queue
            .recv()
            .await
            .map(|m| ConsumerMessage::from_borrowed(&m))
            .map_err(|e| PaymentError::Kafka(e.to_string()));
        Some((next, queue))
    })
    .boxed()
}

/// 分区事件消费者
pub struct PartitionedConsumer {
    consumer: Arc<StreamConsumer>,
    tracking: DeliveryTracking,
    redelivery: RetryPolicy,
}

impl PartitionedConsumer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| PaymentError::Kafka(format!("创建消费者失败: {e}")))?;

        let tracking = DeliveryTracking::from_config(config);
        debug!(brokers = %config.brokers, group_id = %config.consumer_group, ?tracking, "Kafka 消费者客户端已创建");

        Ok(Self {
            consumer: Arc::new(consumer),
            tracking,
            redelivery: config.redelivery_policy(),
        })
    }

    fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), PROBE_TIMEOUT)
            .map_err(|e| PaymentError::Kafka(format!("获取 topic 元数据失败: {e}")))?;

        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .filter(|t| t.name() == topic)
            .flat_map(|t| t.partitions().iter().map(|p| p.id()))
            .collect();

        if partitions.is_empty() {
            return Err(PaymentError::Kafka(format!("topic {topic} 不存在或没有分区")));
        }
        Ok(partitions)
    }

    /// 消费 `topic` 的所有分区，直到关闭信号到达且所有分区单元退出
    pub async fn start(
        &self,
        topic: &str,
        ctx: DispatchContext,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let partitions = self.partitions(topic)?;

        // 先拆分分区队列再分配，避免消息进入主队列
        let mut units = Vec::with_capacity(partitions.len());
        let mut assignment = TopicPartitionList::new();
        for &partition in &partitions {
            let queue = self
                .consumer
                .split_partition_queue(topic, partition)
                .ok_or_else(|| PaymentError::Kafka(format!("无法拆分分区队列: {topic}/{partition}")))?;

            let control = KafkaPartitionControl {
                consumer: Arc::clone(&self.consumer),
                topic: topic.to_string(),
                partition,
                commits: self.tracking.commits(),
            };
            units.push(PartitionUnit::new(
                topic,
                partition,
                partition_stream(queue),
                control,
                ctx.clone(),
                shutdown.clone(),
            ));

            assignment
                .add_partition_offset(topic, partition, self.tracking.initial_offset())
                .map_err(|e| PaymentError::Kafka(format!("构造分区分配失败: {e}")))?;
        }

        self.consumer
            .assign(&assignment)
            .map_err(|e| PaymentError::Kafka(format!("分配分区失败: {e}")))?;

        info!(topic, partitions = ?partitions, tracking = ?self.tracking, "分区消费已启动");

        let consumer = Arc::clone(&self.consumer);
        let main_queue = async move {
            loop {
                match consumer.recv().await {
                    Ok(m) => warn!(
                        partition = m.partition(),
                        offset = m.offset(),
                        "主队列收到未拆分分区的消息"
                    ),
                    Err(e) => error!(error = %e, "Kafka 客户端错误"),
                }
            }
        };

        let states = supervise(units, main_queue).await;
        info!(topic, units = states.len(), "所有分区消费单元已退出");
        Ok(())
    }

    /// 释放分区分配并关闭客户端
    pub fn close(self) {
        if let Err(e) = self.consumer.unassign() {
            warn!(error = %e, "释放分区分配失败");
        }
        info!("Kafka 消费者已关闭");
    }
}

impl BrokerClient for PartitionedConsumer {
    const ROLE: ClientRole = ClientRole::Consumer;

    fn create(config: &KafkaConfig) -> Result<Self> {
        Self::new(config)
    }

    fn probe(&self, timeout: Duration) -> Result<()> {
        self.consumer
            .fetch_metadata(None, timeout)
            .map(|_| ())
            .map_err(|e| PaymentError::Kafka(format!("获取集群元数据失败: {e}")))
    }
}
