//! 通知存储 - 会话内的通知列表与未读计数
//!
//! 纯内存数据结构，不做 I/O。只有 Reconciler 持有可变引用。

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::model::{Notification, NotificationId};

/// 默认保留条数
pub const DEFAULT_RETENTION: usize = 200;

/// 单条 upsert 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// 新插入
    Inserted,
    /// 已存在，字段有变化
    Updated,
    /// 已存在，无变化
    Unchanged,
}

/// 一次列表拉取是否为完整快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    /// 服务端全部通知
    Complete,
    /// 有界分页，未读计数交给独立计数源
    Partial,
}

/// 通知存储
#[derive(Debug, Clone)]
pub struct NotificationStore {
    /// id -> 通知，按 id 升序
    items: BTreeMap<NotificationId, Notification>,
    /// 独立维护的未读计数
    unread_count: u64,
    /// 保留上限
    retention: usize,
    /// 当前 items 是否为服务端完整视图
    complete: bool,
    /// 被淘汰过的 id，最多保留 `retention` 个
    evicted: BTreeSet<NotificationId>,
    /// 不再单独记录的淘汰 id 上界（含）
    evicted_floor: Option<NotificationId>,
}

impl NotificationStore {
    /// 创建空存储，使用默认保留上限
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// 创建带自定义保留上限的存储
    pub fn with_retention(retention: usize) -> Self {
        Self {
            items: BTreeMap::new(),
            unread_count: 0,
            retention: retention.max(1),
            complete: false,
            evicted: BTreeSet::new(),
            evicted_floor: None,
        }
    }

    /// 插入或合并一条通知
    ///
    /// 已读状态取两者中“更多信息”的一方：本地已读则保持已读。
    /// 其余字段以服务端为准。未读计数不在此处调整。
    pub fn upsert(&mut self, incoming: Notification) -> UpsertOutcome {
        match self.items.get_mut(&incoming.id) {
            None => {
                self.evicted.remove(&incoming.id);
                self.items.insert(incoming.id, incoming);
                UpsertOutcome::Inserted
            }
            Some(existing) => {
                let mut merged = incoming;
                merged.is_read = merged.is_read || existing.is_read;
                if *existing == merged {
                    UpsertOutcome::Unchanged
                } else {
                    *existing = merged;
                    UpsertOutcome::Updated
                }
            }
        }
    }

    /// 批量合并列表拉取结果
    ///
    /// 完整快照会重新计算未读计数；有界分页保持计数不变，视图不再完整，
    /// 且不会重新插入已淘汰的条目。
    pub fn upsert_many(&mut self, list: Vec<Notification>, completeness: Completeness) {
        let total = list.len();
        let mut inserted = 0;
        for notification in list {
            if completeness == Completeness::Partial && self.was_evicted(notification.id) {
                continue;
            }
            if self.upsert(notification) == UpsertOutcome::Inserted {
                inserted += 1;
            }
        }

        match completeness {
            Completeness::Complete => {
                self.complete = true;
                self.recompute_unread();
            }
            Completeness::Partial => self.complete = false,
        }

        debug!(total, inserted, ?completeness, "Merged notification list");
    }

    /// 按 items 重新计算未读计数
    pub fn recompute_unread(&mut self) {
        self.unread_count = self.count_unread_items() as u64;
    }

    /// 设置未读计数，负数截为 0；完整视图下不超过条目数
    pub fn set_unread_count(&mut self, n: i64) {
        let mut count = n.max(0) as u64;
        if self.complete {
            count = count.min(self.items.len() as u64);
        }
        self.unread_count = count;
    }

    /// 未读计数加一（推送新通知）
    pub fn increment_unread(&mut self) {
        self.unread_count = self.unread_count.saturating_add(1);
    }

    /// 标记单条已读
    ///
    /// 仅当存在且当前未读时生效，返回是否有变化。
    pub fn mark_read(&mut self, id: NotificationId) -> bool {
        match self.items.get_mut(&id) {
            Some(n) if !n.is_read => {
                n.is_read = true;
                self.unread_count = self.unread_count.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// 全部标记已读
    pub fn mark_all_read(&mut self) {
        for n in self.items.values_mut() {
            n.is_read = true;
        }
        self.unread_count = 0;
    }

    /// 超出保留上限时淘汰最旧的条目，已读优先
    ///
    /// 返回淘汰数量。若不得不淘汰未读条目，视图不再完整。
    pub fn evict_overflow(&mut self) -> usize {
        let overflow = self.items.len().saturating_sub(self.retention);
        if overflow == 0 {
            return 0;
        }

        let mut victims: Vec<NotificationId> = self
            .items
            .values()
            .filter(|n| n.is_read)
            .map(|n| n.id)
            .take(overflow)
            .collect();

        if victims.len() < overflow {
            let remaining = overflow - victims.len();
            victims.extend(
                self.items
                    .values()
                    .filter(|n| !n.is_read)
                    .map(|n| n.id)
                    .take(remaining),
            );
            self.complete = false;
        }

        for id in &victims {
            self.items.remove(id);
            self.remember_evicted(*id);
        }

        debug!(evicted = victims.len(), retained = self.items.len(), "Evicted overflow notifications");
        victims.len()
    }

    fn remember_evicted(&mut self, id: NotificationId) {
        self.evicted.insert(id);
        while self.evicted.len() > self.retention {
            let Some(oldest) = self.evicted.pop_first() else {
                break;
            };
            self.evicted_floor = Some(self.evicted_floor.map_or(oldest, |floor| floor.max(oldest)));
        }
    }

    /// 该 id 曾被淘汰且当前不在存储中
    ///
    /// 超出记录上限的淘汰按 id 上界判断，id 单调递增，上界以下不会出现新通知。
    pub fn was_evicted(&self, id: NotificationId) -> bool {
        if self.items.contains_key(&id) {
            return false;
        }
        self.evicted.contains(&id) || self.evicted_floor.is_some_and(|floor| id <= floor)
    }

    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.items.get(&id)
    }

    pub fn contains(&self, id: NotificationId) -> bool {
        self.items.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn unread_count(&self) -> u64 {
        self.unread_count
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// items 中未读条目数
    pub fn count_unread_items(&self) -> usize {
        self.items.values().filter(|n| !n.is_read).count()
    }

    /// 按最新在前返回全部通知
    pub fn items_newest_first(&self) -> Vec<Notification> {
        self.items.values().rev().cloned().collect()
    }
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}
