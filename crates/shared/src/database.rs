//! PostgreSQL 连接池
//!
//! 支付服务存放支付记录与 outbox，对账服务存放账户余额与去重记录，
//! 两者共用同一套表结构，迁移在各自启动时执行（已执行的迁移会被跳过）。

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::error::Result;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!(min_connections = config.min_connections, "数据库连接池已就绪");
        Ok(Self { pool })
    }

    /// 包装已有的连接池
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 执行工作区根目录 `migrations/` 下尚未执行的迁移
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("数据库迁移完成");
        Ok(())
    }

    /// 等待借出的连接归还后关闭
    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn test_migrations_are_idempotent() {
        let url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| DatabaseConfig::default().url);
        let config = DatabaseConfig {
            url,
            ..Default::default()
        };

        let db = Database::connect(&config).await.unwrap();
        db.run_migrations().await.unwrap();
        db.run_migrations().await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_name IN ('payments', 'payment_event_outbox', 'balance_mutations') \
             ORDER BY table_name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        assert_eq!(tables.len(), 3);

        db.close().await;
    }
}
