//! 余额对账服务
//!
//! 消费 `payments` topic，按分区并发落账，直到收到关闭信号且所有分区消费单元退出。

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use balance_reconciler::{BalanceReconciler, DedupRetention, PgAccountStore};
use payment_shared::config::AppConfig;
use payment_shared::database::Database;
use payment_shared::dlq::DlqProducer;
use payment_shared::kafka::{DispatchContext, KafkaProducer, PartitionedConsumer, connect, topics};
use payment_shared::observability;
use payment_shared::shutdown::shutdown_signal;

const SERVICE_NAME: &str = "balance-reconciler";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("加载配置失败，使用默认配置: {e}");
        AppConfig::default()
    });

    // 2. 初始化日志与指标
    let _guard = observability::init(&config.observability).await?;
    info!(
        environment = %config.environment,
        reversal_policy = ?config.reconciler.reversal_policy,
        "balance-reconciler 启动中"
    );

    // 3. 数据库
    let db = Database::connect(&config.database).await?;
    if config.database.run_migrations {
        db.run_migrations().await?;
    }
    let store = Arc::new(PgAccountStore::new(db.pool().clone()));

    // 4. Kafka 客户端：重试耗尽即退出进程
    let consumer = connect::<PartitionedConsumer>(&config.kafka).await?;
    let dlq = Arc::new(DlqProducer::new(
        connect::<KafkaProducer>(&config.kafka).await?,
        SERVICE_NAME,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 5. 去重记录清理
    let retention = DedupRetention::from_config(store.clone(), &config.reconciler)
        .map(|job| tokio::spawn(job.run(shutdown_rx.clone())));
    if retention.is_none() {
        info!("未配置去重记录保留期，去重记录将永久保留");
    }

    // 6. 分区消费
    let ctx = DispatchContext {
        handler: Arc::new(BalanceReconciler::new(
            store,
            config.reconciler.reversal_policy,
        )),
        dead_letter: dlq.clone(),
        redelivery: config.kafka.redelivery_policy(),
    };

    let result = {
        let consume = consumer.start(topics::PAYMENTS, ctx, shutdown_rx);
        tokio::pin!(consume);
        tokio::select! {
            result = &mut consume => result,
            _ = shutdown_signal() => {
                let _ = shutdown_tx.send(true);
                consume.await
            }
        }
    };
    if let Err(e) = &result {
        error!(error = %e, "分区消费异常结束");
    }

    // 7. 关闭
    let _ = shutdown_tx.send(true);
    if let Some(handle) = retention
        && let Err(e) = handle.await
    {
        warn!(error = %e, "去重记录清理任务异常退出");
    }

    consumer.close();
    match Arc::into_inner(dlq) {
        Some(dlq) => {
            if let Err(e) = dlq.close() {
                warn!(error = %e, "关闭死信生产者失败");
            }
        }
        None => warn!("死信生产者仍被引用，跳过 flush"),
    }
    db.close().await;

    info!("balance-reconciler 已停止");
    result.map_err(Into::into)
}
