//! 去重记录清理
//!
//! 去重记录默认永久保留。配置了保留天数时，周期性删除超出保留期的记录；
//! 保留期应远大于任何可能的重新投递窗口，否则过期后到达的重复事件会被再次落账。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use payment_shared::config::ReconcilerConfig;

use crate::error::Result;
use crate::store::AccountStore;

pub struct DedupRetention<S: AccountStore> {
    store: Arc<S>,
    retention: chrono::Duration,
    interval: Duration,
}

impl<S: AccountStore> DedupRetention<S> {
    /// 未配置保留天数时返回 `None`
    pub fn from_config(store: Arc<S>, config: &ReconcilerConfig) -> Option<Self> {
        let days = config.dedup_retention_days?;
        Some(Self {
            store,
            retention: chrono::Duration::days(i64::from(days)),
            interval: Duration::from_secs(config.cleanup_interval_secs.max(1)),
        })
    }

    /// 执行一次清理，返回删除条数
    pub async fn purge_once(&self) -> Result<u64> {
        let Some(cutoff) = Utc::now().checked_sub_signed(self.retention) else {
            // 保留期早于可表示的最早时间，没有记录会过期
            warn!(retention_days = self.retention.num_days(), "保留期超出时间范围，跳过清理");
            return Ok(0);
        };
        let purged = self.store.purge_applied_before(cutoff).await?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "已清理过期的去重记录");
        }
        Ok(purged)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            retention_days = self.retention.num_days(),
            interval_secs = self.interval.as_secs(),
            "去重记录清理任务已启动"
        );

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.purge_once().await {
                        error!(error = %e, "清理去重记录失败");
                    }
                }
            }
        }

        info!("去重记录清理任务已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockAccountStore;

    fn config(days: Option<u32>) -> ReconcilerConfig {
        ReconcilerConfig {
            dedup_retention_days: days,
            cleanup_interval_secs: 60,
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_without_retention_days() {
        let store = Arc::new(MockAccountStore::new());
        assert!(DedupRetention::from_config(store, &config(None)).is_none());
    }

    #[tokio::test]
    async fn test_purge_uses_retention_cutoff() {
        let mut store = MockAccountStore::new();
        store
            .expect_purge_applied_before()
            .withf(|cutoff| {
                let age = Utc::now() - *cutoff;
                age >= chrono::Duration::days(30) && age < chrono::Duration::days(31)
            })
            .times(1)
            .returning(|_| Ok(12));

        let job = DedupRetention::from_config(Arc::new(store), &config(Some(30))).unwrap();
        assert_eq!(job.purge_once().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_oversized_retention_skips_purge() {
        let mut store = MockAccountStore::new();
        store.expect_purge_applied_before().never();

        let job = DedupRetention::from_config(Arc::new(store), &config(Some(u32::MAX))).unwrap();
        assert_eq!(job.purge_once().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_purges_each_interval_until_shutdown() {
        let mut store = MockAccountStore::new();
        // 首次 tick 立即触发，之后每 60 秒一次
        store
            .expect_purge_applied_before()
            .times(3)
            .returning(|_| Ok(0));

        let job = DedupRetention::from_config(Arc::new(store), &config(Some(7))).unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(job.run(rx));

        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
