//! 进程内推送通道
//!
//! 用于嵌入场景和测试：调用方直接发布原始 JSON 行，
//! 订阅者按与 TCP 通道相同的规则校验。

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{forward_line, PushChannel, PushSubscription};
use crate::adapter::AuthContext;

const FEED_CAPACITY: usize = 256;
const SUBSCRIPTION_BUFFER: usize = 64;

/// 进程内推送通道
#[derive(Debug, Clone)]
pub struct LocalPushChannel {
    feed: broadcast::Sender<String>,
}

impl LocalPushChannel {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self { feed }
    }

    /// 发布一行原始事件，返回收到的订阅者数量
    pub fn publish(&self, line: impl Into<String>) -> usize {
        self.feed.send(line.into()).unwrap_or(0)
    }

    /// 发布一个 JSON 事件
    pub fn publish_value(&self, event: &serde_json::Value) -> usize {
        self.publish(event.to_string())
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }
}

impl Default for LocalPushChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl PushChannel for LocalPushChannel {
    fn name(&self) -> &str {
        "local"
    }

    fn subscribe(&self, auth: &AuthContext) -> PushSubscription {
        let mut feed = self.feed.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let identity = auth.identity.clone();

        let task = tokio::spawn(async move {
            debug!(identity = %identity, "Local push subscription started");
            loop {
                match feed.recv().await {
                    Ok(line) => {
                        if !forward_line(&line, &tx).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // 丢失的事件由周期刷新补偿
                        warn!(skipped, "Local push subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(identity = %identity, "Local push subscription ended");
        });

        PushSubscription::new(rx, Some(task))
    }
}
