//! 远程读写适配层
//!
//! `FetchAdapter` 提供 list/count 两个幂等读操作，`MutationAdapter` 提供
//! mark-one/mark-all 两个幂等写操作。具体传输由实现决定，错误在此边界
//! 归类为 [`SyncError`]。

pub mod http;
pub mod retry;

use std::fmt;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::notification::{Completeness, Notification, NotificationId};

pub use http::{HttpNotificationApi, DEFAULT_API_URL};
pub use retry::RetryPolicy;

/// 已认证会话上下文（由外部认证模块提供）
#[derive(Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// 会话身份，用于判断是否换了用户
    pub identity: String,
    /// Bearer token
    pub token: String,
}

impl AuthContext {
    pub fn new(identity: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("identity", &self.identity)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// 一次列表拉取的结果，最新在前
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationPage {
    pub items: Vec<Notification>,
    pub completeness: Completeness,
}

impl NotificationPage {
    /// 完整快照
    pub fn complete(items: Vec<Notification>) -> Self {
        Self {
            items,
            completeness: Completeness::Complete,
        }
    }

    /// 有界分页
    pub fn partial(items: Vec<Notification>) -> Self {
        Self {
            items,
            completeness: Completeness::Partial,
        }
    }
}

/// 读操作
#[async_trait]
pub trait FetchAdapter: Send + Sync {
    /// 拉取最近的通知（有界，最新在前）
    async fn list(&self, auth: &AuthContext) -> Result<NotificationPage, SyncError>;

    /// 获取未读数
    async fn count(&self, auth: &AuthContext) -> Result<u64, SyncError>;
}

/// 写操作，均为幂等
#[async_trait]
pub trait MutationAdapter: Send + Sync {
    /// 标记单条已读
    async fn mark_one(&self, auth: &AuthContext, id: NotificationId) -> Result<(), SyncError>;

    /// 全部标记已读
    async fn mark_all(&self, auth: &AuthContext) -> Result<(), SyncError>;
}
