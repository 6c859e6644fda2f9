//! 对外发布的只读快照

use serde::Serialize;

use crate::notification::{Notification, NotificationId};

/// 同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// 未认证 / 无存储
    Idle,
    /// 首次拉取进行中
    Syncing,
    /// 存储已填充，周期刷新和推送生效
    Live,
}

/// 通知快照（最新在前）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationSnapshot {
    pub state: SyncState,
    pub items: Vec<Notification>,
    pub unread_count: u64,
    /// 有列表拉取在进行中
    pub is_syncing: bool,
    /// 最近一次刷新失败（暂时性错误）
    pub last_refresh_failed: bool,
    /// 会话失效，需要重新认证
    pub auth_required: bool,
    /// 服务端确认失败的已读标记次数（本地不回滚）
    pub failed_confirmations: u64,
}

impl NotificationSnapshot {
    /// 空闲状态的空快照
    pub fn idle() -> Self {
        Self {
            state: SyncState::Idle,
            items: Vec::new(),
            unread_count: 0,
            is_syncing: false,
            last_refresh_failed: false,
            auth_required: false,
            failed_confirmations: 0,
        }
    }

    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    /// 未读条目
    pub fn unread_items(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter().filter(|n| !n.is_read)
    }

    /// 角标文本：0 不显示，超过 99 显示 "99+"
    pub fn badge_label(&self) -> String {
        match self.unread_count {
            0 => String::new(),
            n if n > 99 => "99+".to_string(),
            n => n.to_string(),
        }
    }
}

impl Default for NotificationSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}
