//! Notify Sync - 通知同步引擎
//!
//! 在全量列表拉取、未读计数拉取和推送通道三个无序来源之间，保持用户的
//! 通知列表与未读计数一致，并支持乐观的已读标记。

pub mod adapter;
pub mod config;
pub mod error;
pub mod notification;
pub mod push;
pub mod reconciler;

pub use adapter::{AuthContext, FetchAdapter, HttpNotificationApi, MutationAdapter, NotificationPage, RetryPolicy};
pub use config::SyncConfig;
pub use error::SyncError;
pub use notification::{Completeness, Notification, NotificationId, NotificationKind, NotificationStore, UpsertOutcome};
pub use push::{LocalPushChannel, PushChannel, PushConfig, PushEvent, PushSubscription, TcpPushChannel};
pub use reconciler::{
    NotificationSnapshot, Reconciler, ReconcilerClosed, ReconcilerHandle, ReconcilerSettings, SyncState,
};
