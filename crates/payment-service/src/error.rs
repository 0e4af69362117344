//! 支付服务错误类型
//!
//! 参数错误与状态错误直接返回给调用方；基础设施错误经共享错误类型透传。

use payment_shared::error::PaymentError;
use payment_shared::events::PaymentStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaymentServiceError {
    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("支付状态不允许此操作: payment_id={payment_id}, current_status={status}")]
    InvalidState { payment_id: i64, status: PaymentStatus },

    #[error("支付记录不存在: {0}")]
    NotFound(i64),

    #[error(transparent)]
    Shared(#[from] PaymentError),
}

pub type Result<T> = std::result::Result<T, PaymentServiceError>;

impl From<sqlx::Error> for PaymentServiceError {
    fn from(err: sqlx::Error) -> Self {
        Self::Shared(PaymentError::Database(err))
    }
}

impl From<serde_json::Error> for PaymentServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Shared(PaymentError::from(err))
    }
}

impl PaymentServiceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Shared(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// 用户可见的业务错误（非系统错误）
    pub fn is_business_error(&self) -> bool {
        !matches!(self, Self::Shared(_))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::NotFound(_) => "PAYMENT_NOT_FOUND",
            Self::Shared(e) => e.code(),
        }
    }
}
