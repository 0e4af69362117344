//! 对账错误类型

use payment_shared::error::PaymentError;
use payment_shared::events::AccountKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("账户不存在: {kind} id={id}")]
    AccountNotFound { kind: AccountKind, id: i64 },

    #[error("事件内容无效: {0}")]
    InvalidEvent(String),

    #[error("账户存储不可用: {0}")]
    Storage(String),

    #[error(transparent)]
    Shared(#[from] PaymentError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

impl From<sqlx::Error> for ReconcileError {
    fn from(err: sqlx::Error) -> Self {
        Self::Shared(PaymentError::Database(err))
    }
}

impl ReconcileError {
    /// 可重试的错误由消费者重新投递处理
    ///
    /// 账户不存在也视为可重试：账户可能尚未同步到本库。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AccountNotFound { .. } | Self::Storage(_) => true,
            Self::InvalidEvent(_) => false,
            Self::Shared(e) => e.is_retryable(),
        }
    }
}
