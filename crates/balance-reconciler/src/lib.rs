//! 余额对账服务
//!
//! 消费 `payments` topic 上的支付生命周期事件，按事件调整卡账户或客户账户的余额。
//!
//! ## 模块结构
//!
//! - `error`: 对账错误类型
//! - `store`: 账户存储（PostgreSQL 与内存实现），提供"落账 + 去重记录"的原子步骤
//! - `reconciler`: 事件到余额变动的映射，以及作为分区消费者处理器的实现
//! - `retention`: 去重记录的定期清理任务
//!
//! ## 幂等
//!
//! 消费是至少一次语义。每个 `(payment_id, event_type)` 只落账一次，
//! 重复投递的事件在去重检查处被吸收。

pub mod error;
pub mod reconciler;
pub mod retention;
pub mod store;

pub use error::{ReconcileError, Result};
pub use reconciler::BalanceReconciler;
pub use retention::DedupRetention;
pub use store::{
    AccountStore, ApplyOutcome, BalanceMutation, InMemoryAccountStore, PgAccountStore,
};
