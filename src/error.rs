//! 同步错误分类
//!
//! 所有适配器错误在边界处归类为以下四种之一，Reconciler 按类别处理，
//! 不会有未分类的错误穿过 Reconciler 边界。

use crate::notification::NotificationId;

/// 通知同步错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// 网络/超时/服务端暂时故障，可重试
    #[error("transient failure: {0}")]
    Transient(String),

    /// 会话失效，不可重试，需要重新认证
    #[error("session rejected: {0}")]
    Auth(String),

    /// 服务端不认识该通知（mark-one 时本地视为成功）
    #[error("notification {0} not found")]
    NotFound(NotificationId),

    /// 推送载荷格式校验失败
    #[error("malformed push event: {0}")]
    MalformedPushEvent(String),
}

impl SyncError {
    /// 是否可以重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// 是否为认证失败
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}
