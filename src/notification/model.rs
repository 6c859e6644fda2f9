//! 通知数据模型 - 服务端通知的封闭形状及传输层校验

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// 通知 ID（服务端分配，全序，作为去重键）
pub type NotificationId = u64;

/// 通知类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// 新的服务请求
    Request,
    /// 收到报价
    Quote,
    /// 预约
    Booking,
    /// 评价
    Review,
    /// 其他
    Generic,
}

impl NotificationKind {
    /// 从服务端 `type` 字段转换，未知类别归为 Generic
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "request" => Self::Request,
            "quote" => Self::Quote,
            "booking" => Self::Booking,
            "review" => Self::Review,
            _ => Self::Generic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Quote => "quote",
            Self::Booking => "booking",
            Self::Review => "review",
            Self::Generic => "generic",
        }
    }

    /// 展示用图标
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Request => "📋",
            Self::Quote => "💰",
            Self::Booking => "📅",
            Self::Review => "⭐",
            Self::Generic => "🔔",
        }
    }
}

/// 通知
///
/// 除 `is_read` 外所有字段由服务端决定；`is_read` 只能经由同步引擎的
/// 变更路径单向从 false 变为 true。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: NotificationId,
    pub kind: NotificationKind,
    /// 展示文本，对引擎不透明
    pub message: String,
    /// 跳转目标，对引擎不透明
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// 仅用于展示，不参与合并决策
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Notification {
    /// 创建未读通知
    pub fn new(id: NotificationId, kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            message: message.into(),
            link: None,
            created_at: Utc::now(),
            is_read: false,
        }
    }

    /// 设置跳转链接
    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    /// 设置已读状态
    pub fn with_read(mut self, is_read: bool) -> Self {
        self.is_read = is_read;
        self
    }

    /// 设置创建时间
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// 从任意 JSON 值校验出通知，失败时返回原因
    pub fn from_value(value: serde_json::Value) -> Result<Self, String> {
        let wire: WireNotification =
            serde_json::from_value(value).map_err(|e| format!("invalid notification shape: {}", e))?;
        Self::try_from(wire)
    }
}

/// 服务端通知的传输格式
#[derive(Debug, Clone, Deserialize)]
pub struct WireNotification {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: String,
}

impl TryFrom<WireNotification> for Notification {
    type Error = String;

    fn try_from(wire: WireNotification) -> Result<Self, Self::Error> {
        if wire.id <= 0 {
            return Err(format!("invalid notification id {}", wire.id));
        }
        let created_at = parse_timestamp(&wire.created_at)?;
        // 空字符串链接等同于无链接
        let link = wire.link.filter(|l| !l.trim().is_empty());

        Ok(Self {
            id: wire.id as NotificationId,
            kind: NotificationKind::from_wire(&wire.kind),
            message: wire.message,
            link,
            created_at,
            is_read: wire.is_read,
        })
    }
}

/// 解析时间戳：RFC 3339，或不带时区的 ISO-8601（按 UTC 处理）
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid created_at '{}': {}", raw, e))
}
