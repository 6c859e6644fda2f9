//! 推送通道 - 异步“新通知”事件流
//!
//! 通道可能随时断开重连，不保证补发，可能重复投递。格式不合法的事件在
//! 通道内记录日志后丢弃，不会到达 Reconciler。

pub mod local;
pub mod tcp;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adapter::AuthContext;
use crate::error::SyncError;
use crate::notification::Notification;

pub use local::LocalPushChannel;
pub use tcp::{PushConfig, TcpPushChannel};

/// 本引擎消费的事件类型
pub const NOTIFICATION_EVENT: &str = "notification";

/// 推送事件
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// 新通知
    Notification(Notification),
    /// 其他类型（留给其他消费者）
    Other(String),
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl PushEvent {
    /// 解析一行推送 JSON
    pub fn parse(line: &str) -> Result<Self, SyncError> {
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| SyncError::MalformedPushEvent(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// 从 JSON 值解析
    pub fn from_value(value: serde_json::Value) -> Result<Self, SyncError> {
        let envelope: RawEnvelope = serde_json::from_value(value)
            .map_err(|e| SyncError::MalformedPushEvent(format!("missing event type: {}", e)))?;

        if envelope.event_type != NOTIFICATION_EVENT {
            return Ok(Self::Other(envelope.event_type));
        }

        let data = envelope
            .data
            .ok_or_else(|| SyncError::MalformedPushEvent("notification event without data".to_string()))?;
        Notification::from_value(data)
            .map(Self::Notification)
            .map_err(SyncError::MalformedPushEvent)
    }
}

/// 推送订阅
///
/// 持有后台任务句柄，drop 时中止任务，保证会话结束后不会遗留订阅。
#[derive(Debug)]
pub struct PushSubscription {
    rx: mpsc::Receiver<Notification>,
    task: Option<JoinHandle<()>>,
}

impl PushSubscription {
    /// 由接收端和后台任务组成订阅
    pub fn new(rx: mpsc::Receiver<Notification>, task: Option<JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    /// 下一条通知；返回 None 表示通道已结束，可重新订阅
    pub async fn next(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// 推送通道
pub trait PushChannel: Send + Sync {
    /// 通道名称（用于日志）
    fn name(&self) -> &str;

    /// 以给定会话订阅，返回惰性的通知序列
    fn subscribe(&self, auth: &AuthContext) -> PushSubscription;
}

/// 处理一行原始推送，只转发新通知事件
///
/// 返回 false 表示接收端已关闭。
pub(crate) async fn forward_line(line: &str, tx: &mpsc::Sender<Notification>) -> bool {
    match PushEvent::parse(line) {
        Ok(PushEvent::Notification(n)) => tx.send(n).await.is_ok(),
        Ok(PushEvent::Other(event_type)) => {
            debug!(event_type = %event_type, "Ignoring push event");
            true
        }
        Err(e) => {
            warn!(error = %e, "Dropping malformed push event");
            true
        }
    }
}
