//! 实时核心错误类型定义

use thiserror::Error;
use uuid::Uuid;

/// 实时核心错误类型
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// 用户当前没有绑定会话
    #[error("User not bound: {0}")]
    UserNotBound(String),

    /// 呼叫会话未找到
    #[error("Call session not found: {0}")]
    CallNotFound(Uuid),

    /// 无效的参数
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// 持久化协作方写入失败
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// 其他错误
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 实时核心结果类型
pub type RealtimeResult<T> = Result<T, RealtimeError>;
