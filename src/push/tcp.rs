//! TCP 推送通道 - 按行分隔的 JSON 事件流，断线自动重连
//!
//! 连接建立后先发送 `{"type":"auth","token":...}`，之后逐行读取事件，
//! 并按间隔发送 `{"type":"heartbeat","timestamp":...}`。

use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use super::{forward_line, PushChannel, PushSubscription};
use crate::adapter::AuthContext;
use crate::notification::Notification;

const SUBSCRIPTION_BUFFER: usize = 64;

/// 推送通道配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// 推送服务地址（host:port），None 表示不启用推送
    pub addr: Option<String>,
    /// 重连等待（毫秒）
    pub reconnect_delay_ms: u64,
    /// 连续连接失败多少次后放弃本次订阅
    pub max_reconnect_attempts: u32,
    /// 心跳间隔（秒），0 表示不发送心跳
    pub heartbeat_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            addr: None,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 5,
            heartbeat_secs: 25,
        }
    }
}

/// 一次连接结束的原因
enum StreamEnd {
    /// 服务端关闭连接
    Disconnected,
    /// 订阅方已不再接收
    ReceiverDropped,
}

/// TCP 推送通道
#[derive(Debug, Clone)]
pub struct TcpPushChannel {
    addr: String,
    config: PushConfig,
}

impl TcpPushChannel {
    pub fn new(addr: impl Into<String>, config: PushConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
        }
    }

    /// 按配置创建，未配置地址时返回 None
    pub fn from_config(config: &PushConfig) -> Option<Self> {
        config
            .addr
            .as_ref()
            .filter(|addr| !addr.trim().is_empty())
            .map(|addr| Self::new(addr.clone(), config.clone()))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// 连接循环：断线重连，连续失败超过上限后结束
    ///
    /// 连接成功但在收到任何一行之前就断开（例如认证被拒）也算一次失败。
    async fn run(self, token: String, tx: mpsc::Sender<Notification>) {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let mut failures: u32 = 0;

        loop {
            let mut received = false;
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    info!(addr = %self.addr, "Connected to push channel");
                    match self.read_stream(stream, &token, &tx, &mut received).await {
                        Ok(StreamEnd::ReceiverDropped) => return,
                        Ok(StreamEnd::Disconnected) => {
                            info!(addr = %self.addr, received, "Push channel disconnected");
                        }
                        Err(e) => {
                            warn!(addr = %self.addr, error = %e, "Push channel read error");
                        }
                    }
                }
                Err(e) => {
                    warn!(addr = %self.addr, attempt = failures + 1, error = %e, "Failed to connect to push channel");
                }
            }

            if received {
                failures = 0;
            } else {
                failures += 1;
                if failures >= self.config.max_reconnect_attempts.max(1) {
                    warn!(addr = %self.addr, attempts = failures, "Giving up on push channel until next subscribe");
                    return;
                }
            }

            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn read_stream(
        &self,
        stream: TcpStream,
        token: &str,
        tx: &mpsc::Sender<Notification>,
        received: &mut bool,
    ) -> std::io::Result<StreamEnd> {
        let (read_half, mut write_half) = stream.into_split();

        let hello = serde_json::json!({"type": "auth", "token": token});
        write_half.write_all(format!("{}\n", hello).as_bytes()).await?;

        let mut lines = BufReader::new(read_half).lines();
        let heartbeat_enabled = self.config.heartbeat_secs > 0;
        let period = Duration::from_secs(self.config.heartbeat_secs.max(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        return Ok(StreamEnd::Disconnected);
                    };
                    *received = true;
                    if line.trim().is_empty() {
                        continue;
                    }
                    if !forward_line(&line, tx).await {
                        return Ok(StreamEnd::ReceiverDropped);
                    }
                }
                _ = heartbeat.tick(), if heartbeat_enabled => {
                    let beat = serde_json::json!({
                        "type": "heartbeat",
                        "timestamp": chrono::Utc::now().timestamp_millis(),
                    });
                    write_half.write_all(format!("{}\n", beat).as_bytes()).await?;
                    debug!(addr = %self.addr, "Sent push heartbeat");
                }
            }
        }
    }
}

impl PushChannel for TcpPushChannel {
    fn name(&self) -> &str {
        "tcp"
    }

    fn subscribe(&self, auth: &AuthContext) -> PushSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let task = tokio::spawn(self.clone().run(auth.token.clone(), tx));
        PushSubscription::new(rx, Some(task))
    }
}
