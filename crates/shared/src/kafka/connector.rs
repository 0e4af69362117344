//! Broker 连接器
//!
//! 服务与 Kafka 通常随同一部署启动，进程启动时 broker 可能尚未就绪。
//! 连接器按固定间隔重试，直到元数据探测成功或重试预算耗尽；
//! 耗尽后返回 [`PaymentError::StartupConnect`]，由 main 终止进程。
//!
//! rdkafka 的客户端创建是惰性的，对不存在的 broker 也会成功，
//! 因此只有元数据请求成功才算连接建立。

use std::fmt;
use std::time::Duration;

use tracing::info;

use crate::config::KafkaConfig;
use crate::error::{PaymentError, Result};
use crate::retry::{RetryPolicy, retry_with_policy};

/// 单次元数据探测的超时
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// 连接角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Producer,
    Consumer,
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producer => f.write_str("producer"),
            Self::Consumer => f.write_str("consumer"),
        }
    }
}

/// 可由连接器建立的 Kafka 客户端
pub trait BrokerClient: Sized {
    const ROLE: ClientRole;

    /// 按配置创建客户端（不产生网络交互）
    fn create(config: &KafkaConfig) -> Result<Self>;

    /// 通过元数据请求确认 broker 可达
    fn probe(&self, timeout: Duration) -> Result<()>;
}

/// 连接 broker，返回可复用的生产者或消费者句柄
pub async fn connect<C: BrokerClient>(config: &KafkaConfig) -> Result<C> {
    info!(
        brokers = %config.brokers,
        role = %C::ROLE,
        max_attempts = config.connect_max_attempts,
        "Connecting to Kafka..."
    );

    let client = connect_with(C::ROLE, &config.connect_policy(), || {
        let client = C::create(config)?;
        client.probe(PROBE_TIMEOUT)?;
        Ok(client)
    })
    .await?;

    info!(brokers = %config.brokers, role = %C::ROLE, "Kafka 连接已建立");
    Ok(client)
}

/// 以给定策略重复执行一次连接尝试
///
/// 每次失败都由重试执行器按 attempt 计数记录日志。
pub(crate) async fn connect_with<C, F>(
    role: ClientRole,
    policy: &RetryPolicy,
    mut attempt: F,
) -> Result<C>
where
    F: FnMut() -> Result<C>,
{
    let operation = format!("kafka_connect_{role}");

    retry_with_policy(policy, &operation, |_| true, || std::future::ready(attempt()))
        .await
        .map_err(|e| PaymentError::StartupConnect {
            role: role.to_string(),
            attempts: policy.max_attempts(),
            message: e.to_string(),
        })
}
