//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    pub fn shutdown(self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 与 `/health` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    describe_pipeline_metrics();
    metrics::counter!("service_starts_total", "service" => config.service_name.clone())
        .increment(1);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 描述事件管道指标，描述会出现在 /metrics 的 HELP 注释中
fn describe_pipeline_metrics() {
    metrics::describe_counter!(
        "payment_events_published_total",
        "Payment lifecycle events handed to the broker"
    );
    metrics::describe_counter!(
        "payment_events_consumed_total",
        "Payment events taken off a partition, by outcome"
    );
    metrics::describe_counter!(
        "balance_mutations_total",
        "Balance deltas applied to card and customer accounts"
    );
    metrics::describe_counter!(
        "outbox_relay_published_total",
        "Outbox rows relayed to the broker"
    );
    metrics::describe_histogram!(
        "balance_apply_duration_seconds",
        "Time spent in one atomic apply-and-record step"
    );
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 管道指标记录函数
// ============================================================================

/// 记录一次事件发布
#[inline]
pub fn record_event_published(event_type: &str, success: bool) {
    metrics::counter!(
        "payment_events_published_total",
        "event_type" => event_type.to_string(),
        "result" => if success { "ok" } else { "error" }
    )
    .increment(1);
}

/// 记录一条消费消息的最终结果
///
/// result 取值：applied | duplicate | skipped | malformed | unknown | failed | dead_lettered
#[inline]
pub fn record_event_consumed(result: &'static str) {
    metrics::counter!("payment_events_consumed_total", "result" => result).increment(1);
}

/// 记录一次已落账的余额变动
#[inline]
pub fn record_balance_mutation(account_kind: &str, event_type: &str, duration_secs: f64) {
    metrics::counter!(
        "balance_mutations_total",
        "account_kind" => account_kind.to_string(),
        "event_type" => event_type.to_string()
    )
    .increment(1);

    metrics::histogram!("balance_apply_duration_seconds").record(duration_secs);
}

/// 记录 outbox 中继发送结果
#[inline]
pub fn record_outbox_relay(success: bool) {
    metrics::counter!(
        "outbox_relay_published_total",
        "result" => if success { "ok" } else { "error" }
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_event_published("PAYMENT_CREATED", true);
        record_event_consumed("applied");
        record_balance_mutation("CARD", "PAYMENT_CREATED", 0.002);
        record_outbox_relay(false);
    }
}
