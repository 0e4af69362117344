//! 支付服务
//!
//! 持有支付生命周期服务与 Kafka 生产者；outbox 模式下同时运行 outbox 中继。
//! 请求接入层不在本进程内，服务以库的形式被上层调用。

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use payment_service::{OutboxRelay, OutboxRepository, PaymentRepository, PaymentService};
use payment_shared::config::{AppConfig, EventDelivery};
use payment_shared::database::Database;
use payment_shared::kafka::{KafkaProducer, connect};
use payment_shared::observability;
use payment_shared::shutdown::shutdown_signal;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置
    let config = AppConfig::load("payment-service").unwrap_or_else(|e| {
        eprintln!("加载配置失败，使用默认配置: {e}");
        AppConfig::default()
    });

    // 2. 初始化日志与指标
    let _guard = observability::init(&config.observability).await?;
    info!(environment = %config.environment, delivery = ?config.payment.event_delivery, "payment-service 启动中");

    // 3. 数据库
    let db = Database::connect(&config.database).await?;
    if config.database.run_migrations {
        db.run_migrations().await?;
    }

    // 4. Kafka 生产者：重试耗尽即退出进程
    let producer = Arc::new(connect::<KafkaProducer>(&config.kafka).await?);

    // 5. 生命周期服务
    let repo = Arc::new(PaymentRepository::new(db.pool().clone()));
    let service = PaymentService::new(repo, producer.clone(), config.payment.event_delivery);
    info!(delivery = ?service.delivery(), "支付生命周期服务已就绪");

    // 6. outbox 中继
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = match config.payment.event_delivery {
        EventDelivery::Outbox => {
            let store = Arc::new(OutboxRepository::new(db.pool().clone()));
            let relay = OutboxRelay::new(store, producer.clone(), &config.payment);
            Some(tokio::spawn(relay.run(shutdown_rx)))
        }
        EventDelivery::BestEffort => None,
    };

    shutdown_signal().await;

    // 7. 先停中继，再关闭生产者
    let _ = shutdown_tx.send(true);
    if let Some(handle) = relay
        && let Err(e) = handle.await
    {
        warn!(error = %e, "outbox 中继任务异常退出");
    }
    drop(service);

    match Arc::into_inner(producer) {
        Some(producer) => producer.close()?,
        None => warn!("生产者仍被引用，跳过 flush"),
    }

    db.close().await;
    info!("payment-service 已停止");
    Ok(())
}
