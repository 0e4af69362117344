//! 仓储层
//!
//! - 仓储只负责持久化，不包含业务规则
//! - outbox 模式下的"支付记录 + 事件"写入在仓储内部用同一事务完成
//! - 定义 trait 接口以支持 mock 测试与内存实现

mod memory;
mod outbox_repo;
mod payment_repo;
mod traits;

pub use memory::InMemoryPaymentRepository;
pub use outbox_repo::OutboxRepository;
pub use payment_repo::PaymentRepository;
pub use traits::*;
