//! 通知模型与会话内存储

pub mod model;
pub mod store;

pub use model::{parse_timestamp, Notification, NotificationId, NotificationKind, WireNotification};
pub use store::{Completeness, NotificationStore, UpsertOutcome, DEFAULT_RETENTION};
