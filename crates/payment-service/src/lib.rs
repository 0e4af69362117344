//! 支付服务
//!
//! 负责支付记录的创建、取消与查询，并在每次状态变更后发出支付生命周期事件。
//!
//! ## 模块结构
//!
//! - `models`: 支付记录与请求模型
//! - `error`: 服务错误类型
//! - `repository`: 支付记录与 outbox 的仓储层（PostgreSQL 与内存实现）
//! - `service`: 支付生命周期服务
//! - `outbox_relay`: outbox 中继，按顺序把未发送的事件发布到 Kafka
//!
//! ## 事件投递
//!
//! 支付记录是资金事实的唯一来源。默认模式下事件在记录落库后尽力发送，
//! 发送失败只记录日志；outbox 模式下事件与记录同事务写入，由中继异步发送。

pub mod error;
pub mod models;
pub mod outbox_relay;
pub mod repository;
pub mod service;

#[cfg(test)]
mod test_support;

pub use error::{PaymentServiceError, Result};
pub use models::{CreatePaymentRequest, NewPayment, OutboxEntry, Payment, PaymentFilter};
pub use outbox_relay::OutboxRelay;
pub use repository::{
    InMemoryPaymentRepository, OutboxRepository, OutboxStore, PaymentRepository,
    PaymentRepositoryTrait,
};
pub use service::PaymentService;
