//! 统一错误处理模块
//!
//! 定义支付事件管道中所有共享的错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum PaymentError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    /// 启动阶段连接 broker 用尽重试次数，进程应直接退出
    #[error("连接 Kafka 失败（{role}，共尝试 {attempts} 次）: {message}")]
    StartupConnect {
        role: String,
        attempts: u32,
        message: String,
    },

    #[error("事件发布失败: topic={topic}, {message}")]
    Publish { topic: String, message: String },

    // ==================== 序列化错误 ====================
    #[error("序列化失败: {0}")]
    Serialization(String),

    #[error("反序列化失败: {0}")]
    Deserialization(String),

    // ==================== 业务错误 ====================
    #[error("参数验证失败: {0}")]
    Validation(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, PaymentError>;

impl PaymentError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::StartupConnect { .. } => "STARTUP_CONNECT_ERROR",
            Self::Publish { .. } => "PUBLISH_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Deserialization(_) => "DESERIALIZATION_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 启动连接失败虽然也是网络问题，但重试已在连接器内部耗尽，不再视为可重试。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Kafka(_) | Self::Publish { .. })
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
