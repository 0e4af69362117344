//! 退避与重试
//!
//! 两处使用同一套策略：
//!
//! - 启动时连接 broker：固定间隔，次数耗尽即终止进程
//! - 消费失败后的重新投递：指数退避，次数耗尽后转入死信队列
//!
//! 重试只针对瞬时故障，是否可重试由调用方判断。

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::PaymentError;

/// 退避策略
///
/// 第 n 次重试前等待 `initial_delay * multiplier^n`，不超过 `max_delay`。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 首次执行之外允许的重试次数
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// 每次等待相同时间
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// 等待时间逐次翻倍
    pub fn exponential(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// 已失败 `failures` 次之后的等待时间
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        // 溢出或非有限值时取上限
        Duration::try_from_secs_f64(secs)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_retries
    }
}

/// 按策略重复执行 `operation`，直到成功、遇到不可重试的错误或次数耗尽
///
/// 返回最后一次的错误。
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&PaymentError) -> bool,
    mut operation: F,
) -> Result<T, PaymentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PaymentError>>,
{
    let max_attempts = policy.max_attempts();
    let mut failures: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if failures > 0 {
                    info!(operation = operation_name, attempts = failures + 1, "重试后恢复");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let retryable = is_retryable(&err);
        if !retryable || !policy.should_retry(failures) {
            warn!(
                operation = operation_name,
                attempt = failures + 1,
                max_attempts,
                retryable,
                error = %err,
                "放弃重试"
            );
            return Err(err);
        }

        let delay = policy.delay_for_attempt(failures);
        warn!(
            operation = operation_name,
            attempt = failures + 1,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "尝试失败，等待后重试"
        );

        tokio::time::sleep(delay).await;
        failures += 1;
    }
}
