//! 共享库
//!
//! 包含支付服务与余额对账服务共用的配置、错误处理、数据库连接、事件模型、
//! Kafka 连接/生产/分区消费等基础设施代码。

pub mod config;
pub mod database;
pub mod dlq;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
pub mod retry;
pub mod shutdown;
